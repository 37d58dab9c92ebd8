use sluice_core::api::UploadEndpoint;
use sluice_core::error::Result;

use crate::progress::format_bytes;

/// Show server-side upload statistics.
pub(crate) fn run(endpoint: &dyn UploadEndpoint) -> Result<()> {
    let stats = endpoint.stats()?;
    println!("Files:    {} total", stats.total_files);
    println!("          {} succeeded, {} failed", stats.success_files, stats.failed_files);
    println!(
        "Bytes:    {} of {} uploaded",
        format_bytes(stats.uploaded_size),
        format_bytes(stats.total_size)
    );
    if stats.average_speed > 0.0 {
        println!("Speed:    {}/s average", format_bytes(stats.average_speed as u64));
    }
    Ok(())
}
