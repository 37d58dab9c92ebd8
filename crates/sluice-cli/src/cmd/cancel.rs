use sluice_core::api::UploadEndpoint;
use sluice_core::error::Result;

/// Cancel a tracked upload: the server discards its stored chunks and
/// drops the task record.
pub(crate) fn run(endpoint: &dyn UploadEndpoint, file_hash: &str, file_name: &str) -> Result<()> {
    endpoint.cancel_upload(file_hash, file_name)?;
    endpoint.delete_task(file_hash, file_name)?;
    println!("Cancelled upload of {file_name}.");
    Ok(())
}
