use serde::Serialize;

/// One JSON document per line.
pub fn dump_lines<T: Serialize>(records: &[T]) -> serde_json::Result<()> {
    for record in records {
        serde_json::to_writer(std::io::stdout(), record)?;
        println!();
    }
    Ok(())
}

pub fn dump_pretty<T: Serialize>(value: &T) -> serde_json::Result<()> {
    serde_json::to_writer_pretty(std::io::stdout(), value)?;
    println!();
    Ok(())
}
