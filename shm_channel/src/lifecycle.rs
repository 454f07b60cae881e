//! Administrative teardown of channels nobody holds a handle to

use crate::area::Backend;
use crate::error::{ShmError, ShmResult};
use crate::platform::{posix, xsi};
use crate::sentinel::Sentinels;
use tracing::info;

/// Destroy the OS objects of channel `name` on `backend` and delete its
/// sentinel markers.
///
/// Removal is never automatic; this is the explicit operation for channels
/// whose creator is gone. Processes that still map the region keep working
/// on it until they detach.
///
/// # Errors
///
/// - [`ShmError::ChannelNotFound`] for a System V channel without markers,
///   since its keys cannot be derived
/// - [`ShmError::RemovalFailure`] when an existing object cannot be removed
///   (for the POSIX backend, also when the object does not exist)
pub fn remove_channel(name: &str, backend: Backend) -> ShmResult<()> {
    let sentinels = Sentinels::for_channel(name);

    match backend {
        Backend::Posix => posix::unlink(name)?,
        Backend::Xsi => {
            if !sentinels.exist() {
                return Err(ShmError::ChannelNotFound {
                    name: name.to_string(),
                });
            }
            xsi::remove_objects(name)?;
        }
    }

    sentinels.clean()?;
    info!("Channel {} ({}) removed", name, backend);
    Ok(())
}
