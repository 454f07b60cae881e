//! Channel protocol: create, exclusively attach to, and tear down a named
//! shared queue region.

use crate::area::{Area, AreaLock, Backend, SharedArea};
use crate::config::{ChannelConfig, ChannelSettings, ConfigLoader};
use crate::error::{ShmError, ShmResult};
use crate::platform::xsi;
use crate::queue::ShmElement;
use crate::region::ShmQueue;
use crate::sentinel::Sentinels;
use bitflags::bitflags;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

bitflags! {
    /// How a [`Channel`] is opened.
    ///
    /// `ATTACH_EXCLUSIVE` takes precedence over `CREATE`: when both are set
    /// nothing is created and the region is not initialized.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelMode: u32 {
        /// Create missing sentinel markers and (re)initialize the region.
        const CREATE           = 0x1;
        /// Require both sentinel markers to exist; never create anything.
        const ATTACH_EXCLUSIVE = 0x2;
        /// Delete sentinel markers before anything else happens. On the
        /// System V backend the segment and semaphore keyed from existing
        /// markers are removed first.
        const CLEAN            = 0x4;
    }
}

impl Default for ChannelMode {
    fn default() -> Self {
        Self::CREATE
    }
}

/// Handle on a shared queue region of `CAP` elements of `T` with `N`
/// mutex/condition variable slots.
///
/// Dropping the handle only unmaps the region; the OS object and the
/// sentinel markers stay until [`Channel::remove`] or
/// [`crate::lifecycle::remove_channel`].
pub struct Channel<T: ShmElement, const CAP: usize, const N: usize> {
    name: String,
    mode: ChannelMode,
    sentinels: Sentinels,
    area: Area,
    region: NonNull<ShmQueue<T, CAP, N>>,
    generation: u64,
}

// SAFETY: the region is only reachable through shared references and is
// made of atomics and process-shared pthread objects.
unsafe impl<T: ShmElement, const CAP: usize, const N: usize> Send for Channel<T, CAP, N> {}
unsafe impl<T: ShmElement, const CAP: usize, const N: usize> Sync for Channel<T, CAP, N> {}

impl<T: ShmElement, const CAP: usize, const N: usize> Channel<T, CAP, N> {
    /// Open channel `name` on `backend`.
    ///
    /// Steps, in order: clean markers (`CLEAN`), check markers
    /// (`ATTACH_EXCLUSIVE`) or create them (`CREATE`), map the region, then
    /// initialize it (`CREATE`) or validate the creator's header.
    ///
    /// # Errors
    ///
    /// - [`ShmError::ChannelNotFound`] on exclusive attach without markers
    /// - [`ShmError::NotInitialized`] / [`ShmError::LayoutMismatch`] when
    ///   attaching to a region no creator published for this layout
    /// - OS failures as [`ShmError::SharedMemoryFailure`],
    ///   [`ShmError::SynchronizationFailure`] or [`ShmError::Io`]
    ///
    /// A failed open leaves no live mapping behind.
    pub fn open(name: &str, mode: ChannelMode, backend: Backend) -> ShmResult<Self> {
        let sentinels = Sentinels::for_channel(name);

        if mode.contains(ChannelMode::CLEAN) {
            // Re-created markers may get the old inode back, and with it the
            // old ftok keys; stale System V objects must go while the keys
            // can still be derived.
            if backend == Backend::Xsi && sentinels.exist() {
                xsi::remove_objects(name)?;
            }
            sentinels.clean()?;
        }

        let exclusive = mode.contains(ChannelMode::ATTACH_EXCLUSIVE);
        if exclusive {
            if !sentinels.exist() {
                return Err(ShmError::ChannelNotFound {
                    name: name.to_string(),
                });
            }
        } else if mode.contains(ChannelMode::CREATE) {
            sentinels.create()?;
        }

        let size = Self::region_size();
        let mut area = Area::new(backend, name, size)?;
        let base = area.attach()?;

        if base.as_ptr().align_offset(std::mem::align_of::<ShmQueue<T, CAP, N>>()) != 0 {
            return Err(ShmError::shm(
                "attach",
                name,
                std::io::Error::other("mapping is not aligned for the region layout"),
            ));
        }
        let region = base.cast::<ShmQueue<T, CAP, N>>();

        let generation = if mode.contains(ChannelMode::CREATE) && !exclusive {
            // SAFETY: the mapping spans exactly region_size() bytes and its
            // alignment was checked above.
            unsafe { ShmQueue::initialize(region.as_ptr())? }
        } else {
            // SAFETY: as above; every bit pattern of the header is valid.
            unsafe { region.as_ref() }.validate(name)?
        };

        info!(
            "Opened {} channel {} ({:?}, {} bytes, generation {})",
            backend, name, mode, size, generation
        );

        Ok(Self {
            name: name.to_string(),
            mode,
            sentinels,
            area,
            region,
            generation,
        })
    }

    /// Open on the memory-mapped named object backend
    pub fn posix(name: &str, mode: ChannelMode) -> ShmResult<Self> {
        Self::open(name, mode, Backend::Posix)
    }

    /// Open on the System V backend
    pub fn xsi(name: &str, mode: ChannelMode) -> ShmResult<Self> {
        Self::open(name, mode, Backend::Xsi)
    }

    /// Open the channel described by `settings`, adding `CLEAN` when the
    /// settings ask for it.
    pub fn from_config(settings: &ChannelSettings, mode: ChannelMode) -> ShmResult<Self> {
        let mode = if settings.clean {
            mode | ChannelMode::CLEAN
        } else {
            mode
        };
        Self::open(&settings.name, mode, settings.backend)
    }

    /// Load and validate a TOML channel configuration, then open the channel
    /// it describes.
    ///
    /// Configuration problems surface as [`ShmError::Config`].
    pub fn from_config_file(path: &Path, mode: ChannelMode) -> ShmResult<Self> {
        let config = ChannelConfig::load(path)?;
        config.validate()?;
        Self::from_config(&config.channel, mode)
    }

    /// Bytes mapped for every channel of this shape
    pub const fn region_size() -> usize {
        ShmQueue::<T, CAP, N>::LAYOUT_SIZE
    }

    /// The shared region: queue plus synchronization slots
    pub fn queue(&self) -> &ShmQueue<T, CAP, N> {
        // SAFETY: the mapping lives as long as self.
        unsafe { self.region.as_ref() }
    }

    /// Area-level lock of the backend
    pub fn lock(&self) -> Arc<dyn AreaLock> {
        self.area.lock()
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mode the channel was opened with
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Backend the channel lives on
    pub fn backend(&self) -> Backend {
        self.area.backend()
    }

    /// Region generation seen when this handle was opened
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `false` once another creator re-initialized the region under this
    /// handle; the queue contents seen since then belong to a new channel.
    pub fn is_current(&self) -> bool {
        self.queue().generation() == self.generation
    }

    /// Unmap the region, reporting failures instead of logging them
    pub fn detach(mut self) -> ShmResult<()> {
        self.area.detach()
    }

    /// Unmap the region, destroy the OS object and delete the sentinel
    /// markers. Other processes keep their mappings until they detach.
    pub fn remove(mut self) -> ShmResult<()> {
        self.area.detach()?;
        self.area.remove()?;
        self.sentinels.clean()?;
        info!("Removed {} channel {}", self.area.backend(), self.name);
        Ok(())
    }
}

impl<T: ShmElement, const CAP: usize, const N: usize> Drop for Channel<T, CAP, N> {
    fn drop(&mut self) {
        match self.area.detach() {
            Ok(()) => debug!("Closed channel {}", self.name),
            Err(e) => warn!("Failed to detach channel {}: {}", self.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        let mode = ChannelMode::CREATE | ChannelMode::CLEAN;
        assert!(mode.contains(ChannelMode::CREATE));
        assert!(!mode.contains(ChannelMode::ATTACH_EXCLUSIVE));
        assert_eq!(mode.bits(), 0x5);
        assert_eq!(ChannelMode::default(), ChannelMode::CREATE);
    }

    #[test]
    fn test_region_size_tracks_shape() {
        assert!(Channel::<u32, 1024, 1>::region_size() > Channel::<u32, 16, 1>::region_size());
        assert!(Channel::<u32, 16, 4>::region_size() > Channel::<u32, 16, 1>::region_size());
    }

    #[test]
    fn test_exclusive_attach_wins_over_create() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("never").to_string_lossy().into_owned();

        let result = Channel::<u32, 16, 1>::posix(
            &name,
            ChannelMode::CREATE | ChannelMode::ATTACH_EXCLUSIVE,
        );
        assert!(matches!(result, Err(ShmError::ChannelNotFound { .. })));
        assert!(!Sentinels::for_channel(&name).primary().exists());
    }

    #[test]
    fn test_config_file_errors_surface_as_config() {
        let result = Channel::<u32, 16, 1>::from_config_file(
            Path::new("/nonexistent/channel.toml"),
            ChannelMode::CREATE,
        );
        assert!(matches!(
            result,
            Err(ShmError::Config {
                source: crate::config::ConfigError::FileNotFound
            })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.toml");
        std::fs::write(&path, "[channel]\nname = \"\"\n").unwrap();
        assert!(matches!(
            Channel::<u32, 16, 1>::from_config_file(&path, ChannelMode::CREATE),
            Err(ShmError::Config {
                source: crate::config::ConfigError::ValidationError(_)
            })
        ));
    }

    #[test]
    fn test_open_from_config_file() -> ShmResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("configured").to_string_lossy().into_owned();
        let path = dir.path().join("channel.toml");
        std::fs::write(
            &path,
            format!("[channel]\nname = \"{name}\"\nbackend = \"posix\"\nclean = true\n"),
        )?;

        let channel = Channel::<u32, 16, 1>::from_config_file(&path, ChannelMode::CREATE)?;
        assert_eq!(channel.name(), name);
        assert!(channel.mode().contains(ChannelMode::CLEAN));
        channel.queue().try_push(1).unwrap();
        channel.remove()
    }
}
