use sluice_core::api::UploadEndpoint;
use sluice_core::error::Result;

use crate::progress::format_bytes;

/// List the server's upload task records, optionally clearing them.
pub(crate) fn run(endpoint: &dyn UploadEndpoint, clear: bool) -> Result<()> {
    let tasks = endpoint.list_tasks()?;
    if tasks.is_empty() {
        println!("No upload tasks.");
        return Ok(());
    }

    println!(
        "{:<18} {:<32} {:>10} {:>9} {:>8}  {}",
        "HASH", "NAME", "SIZE", "CHUNKS", "PROG", "STATUS"
    );
    for task in &tasks {
        let hash_prefix: String = task.file_hash.chars().take(16).collect();
        println!(
            "{:<18} {:<32} {:>10} {:>4}/{:<4} {:>6.1}%  {}",
            hash_prefix,
            task.file_name,
            format_bytes(task.file_size),
            task.uploaded_chunks,
            task.total_chunks,
            task.progress,
            task.status,
        );
    }

    if clear {
        let hashes: Vec<String> = tasks.iter().map(|t| t.file_hash.clone()).collect();
        endpoint.delete_tasks(&hashes)?;
        println!("Deleted {} task record(s).", hashes.len());
    }
    Ok(())
}

/// List the chunk indices the server holds for one upload.
pub(crate) fn run_chunks(
    endpoint: &dyn UploadEndpoint,
    file_hash: &str,
    file_name: &str,
) -> Result<()> {
    let chunks = endpoint.uploaded_chunks(file_hash, file_name)?;
    if chunks.is_empty() {
        println!("No chunks stored for {file_name}.");
        return Ok(());
    }
    let rendered: Vec<String> = chunks.iter().map(|i| i.to_string()).collect();
    println!("{} chunk(s): {}", chunks.len(), rendered.join(", "));
    Ok(())
}
