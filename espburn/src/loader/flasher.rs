//! Writing partitions to SPI flash through a ROM or stub loader.

use {
    crate::{
        error::{Error, Result},
        image::{self, FlashArgs, PAD_BYTE},
        port::Port,
        protocol::channel::CommandChannel,
        target::{
            chip::{CHIP_DETECT_MAGIC_REG_ADDR, ChipProfile},
            reset::ResetStrategy,
        },
    },
    flate2::{Compression, write::ZlibEncoder},
    log::{debug, info, warn},
    std::io::Write,
};

/// Progress of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FlashProgress {
    /// Index of the partition in [`FlashArgs::partitions`].
    pub index: usize,
    /// Blocks acknowledged so far.
    ///
    /// Reads `blocks_total + 1` once a stub target has committed the
    /// partition.
    pub blocks_written: u32,
    /// Blocks in this partition.
    pub blocks_total: u32,
}

/// Streams partitions to flash over a command channel.
pub struct FlashProgrammer<'a, P: Port> {
    channel: &'a mut CommandChannel<P>,
    profile: &'a ChipProfile,
    compress: bool,
    interrupted: fn() -> bool,
}

impl<'a, P: Port> FlashProgrammer<'a, P> {
    /// A programmer for the loader described by `profile`.
    pub fn new(channel: &'a mut CommandChannel<P>, profile: &'a ChipProfile) -> Self {
        Self {
            channel,
            profile,
            compress: true,
            interrupted: crate::is_interrupted_requested,
        }
    }

    /// Enable or disable on-the-wire compression.
    ///
    /// Loaders without the FLASH_DEFL_* commands always get raw data.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Replace the check polled between blocks.
    #[must_use]
    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    fn uses_compression(&self) -> bool {
        self.compress && self.profile.supports_compression
    }

    /// Attach SPI flash with a zero-size FLASH_BEGIN.
    pub fn attach_flash(&mut self) -> Result<()> {
        debug!("Attaching SPI flash");
        self.channel
            .flash_begin(0, 0, self.profile.flash_write_size, 0)
    }

    /// Write every partition, then finish and reset stub targets.
    pub fn flash(&mut self, args: &FlashArgs, progress: &mut dyn FnMut(FlashProgress)) -> Result<()> {
        let compress = self.uses_compression();

        for (index, partition) in args
            .partitions
            .iter()
            .enumerate()
        {
            let mut data = image::pad_image(&partition.image);
            if data.is_empty() {
                warn!("Skipping empty partition {}", partition.label());
                continue;
            }
            image::patch_header(&mut data, partition.address, args, self.profile)?;

            info!(
                "Writing {} ({} bytes) at 0x{:08X}",
                partition.label(),
                data.len(),
                partition.address
            );
            let total = if compress {
                self.write_compressed(index, partition.address, &data, progress)?
            } else {
                self.write_raw(index, partition.address, &data, progress)?
            };

            if self.profile.is_stub {
                // the stub acknowledges blocks before they are written;
                // any command after the last one waits for the flash write
                self.channel
                    .read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
                progress(FlashProgress {
                    index,
                    blocks_written: total + 1,
                    blocks_total: total,
                });
            }
        }

        if self.profile.is_stub {
            self.channel
                .flash_begin(0, 0, self.profile.flash_write_size, 0)?;
            if compress {
                self.channel
                    .flash_defl_finish(false)?;
            } else {
                self.channel
                    .flash_finish(false)?;
            }
            info!("Hard resetting");
            ResetStrategy::Hard.apply(self.channel.port_mut())?;
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        if (self.interrupted)() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn write_raw(
        &mut self,
        index: usize,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<u32> {
        let write_size = self.profile.flash_write_size;
        let size = image_len(data)?;
        let blocks = self.profile.flash_blocks(size);
        let erase_size = self.profile.erase_size(address, size);
        debug!("FLASH_BEGIN erase={erase_size} blocks={blocks} at 0x{address:08X}");

        self.channel
            .flash_begin(erase_size, blocks, write_size, address)?;

        for (seq, chunk) in (0u32..).zip(data.chunks(write_size as usize)) {
            self.check_interrupt()?;
            let mut block = chunk.to_vec();
            block.resize(write_size as usize, PAD_BYTE);
            self.channel
                .flash_block(&block, seq)?;
            progress(FlashProgress {
                index,
                blocks_written: seq + 1,
                blocks_total: blocks,
            });
        }
        Ok(blocks)
    }

    fn write_compressed(
        &mut self,
        index: usize,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(FlashProgress),
    ) -> Result<u32> {
        let write_size = self.profile.flash_write_size;
        let size = image_len(data)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        let compressed_size = image_len(&compressed)?;
        let blocks = compressed_size.div_ceil(write_size);

        // the stub takes the byte count and erases as it goes; the ROM wants
        // the erase region rounded up to whole write blocks
        let begin_size = if self.profile.is_stub {
            size
        } else {
            self.profile.flash_blocks(size) * write_size
        };
        debug!("Compressed {size} bytes to {compressed_size}");

        self.channel
            .flash_defl_begin(begin_size, blocks, write_size, address)?;

        for (seq, chunk) in (0u32..).zip(compressed.chunks(write_size as usize)) {
            self.check_interrupt()?;
            self.channel
                .flash_defl_block(chunk, seq)?;
            progress(FlashProgress {
                index,
                blocks_written: seq + 1,
                blocks_total: blocks,
            });
        }
        Ok(blocks)
    }
}

fn image_len(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len()).map_err(|_| Error::InvalidImage("image larger than 4 GiB".into()))
}
