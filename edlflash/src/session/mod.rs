//! Session controller.
//!
//! A [`Session`] owns the transport for the lifetime of one device and
//! decides which engine talks to it. A fresh device starts in the boot ROM:
//!
//! ```text
//! open -> greet -> [bootstrap: identify, upload loader, handoff]
//!      -> wait for disconnect -> reopen -> configure -> operations
//! ```
//!
//! A device whose loader is already running skips straight to `configure`.
//! Every operation blocks until it finishes or fails; a failed operation
//! is never replayed behind the caller's back.

mod batch;
pub mod config;

pub use {
    batch::{BatchEntry, BatchReport, Outcome},
    config::{DEFAULT_MAX_PAYLOAD, DeviceMode, Protocol, SessionConfig, SessionState, Timeouts},
};

use {
    crate::{
        engine::{
            BootstrapEngine, BootstrapState, CommandEngine, CommandState, DeviceInfo, Negotiated,
            StorageInfo,
        },
        error::{Error, ProtocolError, Result},
        image::{
            gpt::{Gpt, GptEntry, GptHeader},
            source::{ImageSource, SliceSource},
        },
        protocol::firehose::{PatchParams, PowerAction, SectorRange},
        transport::Transport,
    },
    log::{debug, info, warn},
    std::{fs, io::Write, path::Path},
};

/// One device, driven through both protocols.
pub struct Session<T: Transport> {
    io: T,
    config: SessionConfig,
    state: SessionState,
    bootstrap: BootstrapEngine,
    command: CommandEngine,
    interrupted: fn() -> bool,
}

impl<T: Transport> Session<T> {
    /// Wrap an open transport. Nothing is sent until [`Session::connect`].
    pub fn new(io: T, config: SessionConfig) -> Self {
        Self {
            state: SessionState::new(&config),
            bootstrap: BootstrapEngine::new(config.timeouts.hello),
            command: CommandEngine::new(),
            io,
            config,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Replace the check consulted between operations.
    #[must_use]
    pub fn with_interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = check;
        self
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// What is known about the device.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.io
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.io
    }

    /// State of the bootstrap engine.
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }

    /// State of the command engine.
    pub fn command_state(&self) -> CommandState {
        self.command.state()
    }

    /// Sector size in effect (negotiated once the loader answered).
    pub fn sector_size(&self) -> usize {
        self.state.sector_size
    }

    fn checkpoint(&self) -> Result<()> {
        if (self.interrupted)() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Forget the loader if the last command left the engine disconnected.
    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if self.command.state() == CommandState::Disconnected
                && self.state.protocol == Some(Protocol::Command)
            {
                warn!("Lost the loader on {}: {e}", self.io.name());
                self.state.reset();
            }
        }
        result
    }

    fn negotiate(&mut self) -> Result<Negotiated> {
        let negotiated = self
            .command
            .configure(&mut self.io, &self.config)?;
        self.state.protocol = Some(Protocol::Command);
        self.state.mode = DeviceMode::Emergency;
        self.state.max_payload = Some(negotiated.max_payload);
        self.state.sector_size = negotiated.sector_size;
        Ok(negotiated)
    }

    /// Detect the device and start whichever protocol it speaks.
    ///
    /// The boot ROM greets first; if nothing greets within the hello
    /// timeout, a `nop` checks for a loader that is already running.
    pub fn connect(&mut self) -> Result<Protocol> {
        self.checkpoint()?;
        self.state.reset();
        self.bootstrap = BootstrapEngine::new(self.config.timeouts.hello);
        self.command = CommandEngine::new();

        let greeting = if self.config.identify {
            self.bootstrap
                .identify(&mut self.io)
                .map(Some)
        } else {
            self.bootstrap
                .authenticate(&mut self.io)
                .map(|()| None)
        };

        match greeting {
            Ok(info) => {
                self.state.protocol = Some(Protocol::Bootstrap);
                self.state.mode = DeviceMode::Emergency;
                self.state.device_info = info;
                info!("Boot ROM answered on {}", self.io.name());
                return Ok(Protocol::Bootstrap);
            },
            Err(Error::Protocol(ProtocolError::NoResponse(msg))) => {
                debug!("No boot ROM greeting ({msg}); checking for a running loader");
            },
            Err(e) => return Err(e),
        }

        if let Err(e) = self.io.clear_buffers() {
            debug!("Could not clear buffers before the nop: {e}");
        }
        if let Err(e) = self
            .command
            .ping(&mut self.io, &self.config)
        {
            return Err(ProtocolError::NoResponse(format!(
                "{} answered neither the boot ROM nor the loader protocol ({e})",
                self.io.name()
            ))
            .into());
        }

        info!("Loader already running on {}", self.io.name());
        self.negotiate()?;
        Ok(Protocol::Command)
    }

    /// Upload the loader at `path`, wait for the device to re-enumerate and
    /// negotiate with the loader.
    pub fn load_agent<P, F>(&mut self, path: P, progress: F) -> Result<Negotiated>
    where
        P: AsRef<Path>,
        F: FnMut(usize, usize),
    {
        let path = path.as_ref();
        let loader = fs::read(path).map_err(|e| {
            Error::InvalidImage(format!("cannot read loader {}: {e}", path.display()))
        })?;
        self.load_agent_bytes(&loader, progress)
    }

    /// [`Session::load_agent`] for an image already in memory.
    ///
    /// If the loader is already running the upload is skipped.
    pub fn load_agent_bytes<F>(&mut self, loader: &[u8], progress: F) -> Result<Negotiated>
    where
        F: FnMut(usize, usize),
    {
        self.checkpoint()?;
        if self.state.protocol.is_none() {
            self.connect()?;
        }
        if self.state.protocol == Some(Protocol::Command) {
            info!("Loader already running; not uploading");
            return match self.command.negotiated() {
                Some(negotiated) => Ok(negotiated),
                None => self.negotiate(),
            };
        }

        self.bootstrap
            .upload_loader(&mut self.io, loader, progress)?;
        self.state.reset();

        self.io.close()?;
        if self
            .io
            .wait_for_disconnect(self.config.timeouts.disconnect)
        {
            debug!("{} dropped off the bus", self.io.name());
        } else {
            warn!(
                "{} still present {:?} after the handoff; reopening anyway",
                self.io.name(),
                self.config.timeouts.disconnect
            );
        }

        let io = &mut self.io;
        self.config
            .reopen_retry
            .run("reopen", |_| io.reopen())?;
        info!("Reconnected to the loader on {}", self.io.name());

        self.command = CommandEngine::new();
        self.negotiate()
    }

    /// Erase a sector range on the configured physical partition.
    pub fn erase(&mut self, range: SectorRange) -> Result<()> {
        self.checkpoint()?;
        let result = self
            .command
            .erase(&mut self.io, &self.config, range, self.config.partition);
        self.settle(result)
    }

    /// Erase the partition called `name`.
    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        let entry = self.find_partition(name)?;
        let sectors = entry.sectors()?;
        info!("Erasing {name} ({sectors} sectors)");
        self.erase(SectorRange::new(entry.first_lba, sectors))
    }

    /// Write `source` to `range` on the configured physical partition.
    pub fn write_range<S, F>(&mut self, range: SectorRange, source: &mut S, progress: F) -> Result<()>
    where
        S: ImageSource + ?Sized,
        F: FnMut(u64, u64),
    {
        let partition = self.config.partition;
        self.write_range_on(partition, range, source, progress)
    }

    fn write_range_on<S, F>(
        &mut self,
        partition: u32,
        range: SectorRange,
        source: &mut S,
        progress: F,
    ) -> Result<()>
    where
        S: ImageSource + ?Sized,
        F: FnMut(u64, u64),
    {
        self.checkpoint()?;
        let result = self.command.program(
            &mut self.io,
            &self.config,
            range,
            partition,
            source,
            progress,
        );
        self.settle(result)
    }

    /// Read `range` on the configured physical partition into `sink`.
    pub fn read_range<W, F>(&mut self, range: SectorRange, sink: &mut W, progress: F) -> Result<u64>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        self.checkpoint()?;
        let result = self.command.read(
            &mut self.io,
            &self.config,
            range,
            self.config.partition,
            sink,
            progress,
        );
        self.settle(result)
    }

    fn read_vec(&mut self, range: SectorRange) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_range(range, &mut buf, |_, _| {})?;
        Ok(buf)
    }

    /// Read the primary partition table of the configured physical
    /// partition.
    ///
    /// The header CRC is checked before the entry array is fetched; the
    /// entry-array CRC is left to [`Gpt::verify`].
    pub fn read_gpt(&mut self) -> Result<Gpt> {
        let ss = self.sector_size();
        let head = self.read_vec(SectorRange::new(1, 1))?;
        let header = GptHeader::parse(&head)?;
        if !header.header_crc_valid() {
            return Err(ProtocolError::IntegrityCheck(format!(
                "primary GPT header CRC mismatch on LUN {}",
                self.config.partition
            ))
            .into());
        }
        let entries = self.read_vec(SectorRange::new(
            header.partition_entry_lba,
            header.entry_sectors(ss),
        ))?;
        Gpt::from_parts(header, entries)
    }

    fn read_backup_gpt(&mut self, lba: u64, sectors: u64) -> Result<Gpt> {
        let ss = self.sector_size();
        let image = self.read_vec(SectorRange::new(lba, sectors))?;
        let header_at = usize::try_from(sectors)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| n.checked_mul(ss))
            .filter(|at| *at < image.len())
            .ok_or_else(|| {
                Error::InvalidImage(format!("backup GPT of {sectors} sectors has no header"))
            })?;
        let header = GptHeader::parse(&image[header_at..])?;
        Gpt::from_parts(header, image[..header_at].to_vec())
    }

    /// Look a partition up in a table whose CRCs check out.
    pub fn find_partition(&mut self, name: &str) -> Result<GptEntry> {
        let gpt = self.read_gpt()?;
        gpt.verify()
            .map_err(|e| ProtocolError::IntegrityCheck(format!("primary GPT: {e}")))?;
        gpt.find(name)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "no partition named \"{name}\" on LUN {}",
                    self.config.partition
                ))
            })
    }

    /// Write `source` into the partition called `name`.
    ///
    /// The image must fit; only the sectors it covers are written.
    pub fn write_partition<S, F>(&mut self, name: &str, source: &mut S, progress: F) -> Result<()>
    where
        S: ImageSource + ?Sized,
        F: FnMut(u64, u64),
    {
        let entry = self.find_partition(name)?;
        let ss = self.sector_size() as u64;
        let len = source
            .total_len()
            .ok_or_else(|| Error::InvalidImage(format!("length of the image for {name} is unknown")))?;
        let sectors = len.div_ceil(ss);
        if sectors == 0 {
            return Err(Error::InvalidImage(format!("image for {name} is empty")));
        }
        let capacity = entry.sectors()?;
        if sectors > capacity {
            return Err(Error::InvalidImage(format!(
                "{len}-byte image does not fit {name} ({capacity} sectors)"
            )));
        }

        info!("Writing {len} bytes to {name}");
        self.write_range(SectorRange::new(entry.first_lba, sectors), source, progress)
    }

    /// Write a primary table image (LBA 0 onwards) and the backup copy
    /// derived from it, then read both back and check their CRCs.
    pub fn restore_gpt(&mut self, image: &[u8]) -> Result<Gpt> {
        let ss = self.sector_size();
        let gpt = Gpt::parse_primary(image, ss)?;
        let primary_sectors = gpt.primary_sectors(ss);
        let primary = usize::try_from(primary_sectors)
            .ok()
            .and_then(|n| n.checked_mul(ss))
            .and_then(|len| image.get(..len))
            .ok_or_else(|| {
                Error::InvalidImage(format!("GPT image shorter than {primary_sectors} sectors"))
            })?;

        let (backup_lba, backup) = gpt.backup_image(ss)?;

        self.write_range(
            SectorRange::new(0, primary_sectors),
            &mut SliceSource::new(primary),
            |_, _| {},
        )?;

        let backup_sectors = (backup.len() / ss) as u64;
        self.write_range(
            SectorRange::new(backup_lba, backup_sectors),
            &mut SliceSource::new(&backup),
            |_, _| {},
        )?;

        let readback = self.read_vec(SectorRange::new(0, primary_sectors))?;
        if readback != primary {
            return Err(ProtocolError::IntegrityCheck(
                "primary GPT reads back different from what was written".into(),
            )
            .into());
        }
        let written = self.read_gpt()?;
        written
            .verify()
            .map_err(|e| ProtocolError::IntegrityCheck(format!("primary GPT: {e}")))?;
        self.read_backup_gpt(backup_lba, backup_sectors)?
            .verify()
            .map_err(|e| ProtocolError::IntegrityCheck(format!("backup GPT: {e}")))?;

        info!(
            "GPT restored: {} partitions, backup at LBA {backup_lba}",
            written.entries.len()
        );
        Ok(written)
    }

    /// Carve the four general-purpose partitions (sizes in KiB) and make
    /// the first user partition bootable.
    pub fn create_partitions(&mut self, sizes_kb: [u32; 4]) -> Result<()> {
        self.checkpoint()?;
        let result = self
            .command
            .create_storage_drives(&mut self.io, &self.config, sizes_kb);
        self.settle(result)?;
        self.set_active_partition(1)
    }

    /// Select the boot partition. A NAK is an error.
    pub fn set_active_partition(&mut self, index: u32) -> Result<()> {
        self.checkpoint()?;
        let result = self
            .command
            .set_bootable(&mut self.io, &self.config, index);
        self.settle(result)?;
        self.state.active_partition = Some(index);
        Ok(())
    }

    /// Reset the device through whichever protocol is active.
    pub fn reset_device(&mut self) -> Result<()> {
        self.checkpoint()?;
        let result = if self.command.state() == CommandState::Ready {
            self.command
                .power(&mut self.io, &self.config, PowerAction::Reset, 0)
        } else {
            self.bootstrap.reset(&mut self.io)
        };
        self.state.reset();
        result
    }

    /// Identity read from the boot ROM during [`Session::connect`].
    pub fn dump_device_info(&self) -> Result<DeviceInfo> {
        self.state
            .device_info
            .clone()
            .ok_or_else(|| {
                Error::Unsupported(
                    "device identity is only readable from the boot ROM before the loader runs"
                        .into(),
                )
            })
    }

    /// Storage description of the configured physical partition.
    pub fn storage_info(&mut self) -> Result<StorageInfo> {
        let partition = self.config.partition;
        self.storage_info_for(partition)
    }

    fn storage_info_for(&mut self, partition: u32) -> Result<StorageInfo> {
        self.checkpoint()?;
        let result = self
            .command
            .storage_info(&mut self.io, &self.config, partition);
        self.settle(result)
    }

    /// Dump `size` bytes of device memory at `address` as log lines.
    pub fn peek(&mut self, address: u64, size: u64) -> Result<Vec<String>> {
        self.checkpoint()?;
        let result = self
            .command
            .peek(&mut self.io, &self.config, address, size);
        self.settle(result)
    }

    /// Apply one patch entry.
    pub fn patch(&mut self, params: PatchParams) -> Result<()> {
        self.checkpoint()?;
        let result = self
            .command
            .patch(&mut self.io, &self.config, params);
        self.settle(result)
    }
}
