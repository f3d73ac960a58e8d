use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cell(row: &[String], i: usize) -> &str {
    row.get(i).map(String::as_str).unwrap_or("")
}

/// Column-aligned table. Columns whose every cell parses as an integer
/// (sequence numbers, counts) are right-aligned.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let columns = headers.len();
    let widths: Vec<usize> = (0..columns)
        .map(|i| {
            rows.iter()
                .map(|row| cell(row, i).len())
                .fold(headers[i].len(), usize::max)
        })
        .collect();
    let numeric: Vec<bool> = (0..columns)
        .map(|i| !rows.is_empty() && rows.iter().all(|row| cell(row, i).parse::<i64>().is_ok()))
        .collect();

    let render = |cells: Vec<&str>| -> String {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let width = widths[i];
                if numeric[i] {
                    format!("{text:>width$}")
                } else {
                    format!("{text:<width$}")
                }
            })
            .collect();
        line.join("  ").trim_end().to_string()
    };

    println!("{}", render(headers.to_vec()));
    println!(
        "{}",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  ")
    );
    for row in &rows {
        println!("{}", render((0..columns).map(|i| cell(row, i)).collect()));
    }
}
