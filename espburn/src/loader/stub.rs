//! Flasher stub images and the RAM upload that starts them.
//!
//! Stubs ship as JSON assets produced at build time from the stub ELF:
//!
//! ```json
//! { "entry": 1074521560, "text_start": 1074520064, "text": "eNrt...",
//!   "data_start": 1073605544, "data": "eNpj..." }
//! ```
//!
//! Each segment is base64 of zlib-compressed bytes.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::channel::CommandChannel,
        target::chip::{ChipFamily, ChipProfile},
    },
    base64::{Engine as _, engine::general_purpose::STANDARD},
    flate2::read::ZlibDecoder,
    log::{debug, info},
    serde::Deserialize,
    std::{
        collections::HashMap,
        fs,
        io::Read,
        path::Path,
        thread,
        time::Duration,
    },
};

/// Time the stub needs to set up its command loop after MEM_END.
const STUB_STARTUP_DELAY: Duration = Duration::from_millis(500);

/// A flasher stub as loaded from its JSON asset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StubImage {
    /// Encoded text segment.
    #[serde(default)]
    pub text: Option<String>,
    /// Load address of the text segment.
    #[serde(default)]
    pub text_start: Option<u32>,
    /// Encoded data segment.
    #[serde(default)]
    pub data: Option<String>,
    /// Load address of the data segment.
    #[serde(default)]
    pub data_start: Option<u32>,
    /// Entry point.
    pub entry: u32,
}

/// A decoded segment ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSegment {
    /// Segment name (`text` or `data`).
    pub name: &'static str,
    /// RAM load address.
    pub address: u32,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl StubImage {
    /// Parse a JSON asset.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Stub(format!("invalid stub JSON: {e}")))
    }

    /// Load a JSON asset from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Decode the present segments, text first.
    pub fn segments(&self) -> Result<Vec<StubSegment>> {
        let mut segments = Vec::with_capacity(2);
        for (name, encoded, address) in [
            ("text", &self.text, self.text_start),
            ("data", &self.data, self.data_start),
        ] {
            match (encoded, address) {
                (Some(encoded), Some(address)) => segments.push(StubSegment {
                    name,
                    address,
                    bytes: decode_segment(name, encoded)?,
                }),
                (None, _) => {},
                (Some(_), None) => {
                    return Err(Error::Stub(format!("{name} segment has no load address")));
                },
            }
        }
        Ok(segments)
    }
}

fn decode_segment(name: &str, encoded: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Stub(format!("{name} segment is not valid base64: {e}")))?;

    let mut bytes = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|e| Error::Stub(format!("{name} segment failed to decompress: {e}")))?;
    Ok(bytes)
}

/// Stub images by chip family.
#[derive(Debug, Clone, Default)]
pub struct StubStore {
    stubs: HashMap<ChipFamily, StubImage>,
}

impl StubStore {
    /// An empty store: every family stays on its ROM loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asset file name for a family, e.g. `stub_flasher_32c3.json`.
    pub fn file_name(family: ChipFamily) -> &'static str {
        match family {
            ChipFamily::Esp8266 => "stub_flasher_8266.json",
            ChipFamily::Esp32 => "stub_flasher_32.json",
            ChipFamily::Esp32s2 => "stub_flasher_32s2.json",
            ChipFamily::Esp32s3 => "stub_flasher_32s3.json",
            ChipFamily::Esp32c3 => "stub_flasher_32c3.json",
            ChipFamily::Esp32c2 => "stub_flasher_32c2.json",
            ChipFamily::Esp32c6 => "stub_flasher_32c6.json",
        }
    }

    /// Load every `stub_flasher_*.json` present in `dir`.
    ///
    /// Missing files are fine; malformed ones are an error.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "stub directory {} does not exist",
                dir.display()
            )));
        }

        let mut store = Self::new();
        for family in ChipFamily::DETECTION_ORDER {
            let path = dir.join(Self::file_name(family));
            if path.is_file() {
                debug!("Loading stub for {family} from {}", path.display());
                store.insert(family, StubImage::from_file(&path)?);
            }
        }
        Ok(store)
    }

    /// Register a stub for a family, replacing any previous one.
    pub fn insert(&mut self, family: ChipFamily, image: StubImage) {
        self.stubs
            .insert(family, image);
    }

    /// The stub for a family, if any.
    pub fn get(&self, family: ChipFamily) -> Option<&StubImage> {
        self.stubs
            .get(&family)
    }

    /// Number of families with a stub.
    pub fn len(&self) -> usize {
        self.stubs
            .len()
    }

    /// Whether no stub is registered.
    pub fn is_empty(&self) -> bool {
        self.stubs
            .is_empty()
    }
}

/// Upload `image` into RAM, start it, and rebind the channel to the stub.
///
/// Returns the channel and the stub variant of `profile`.
pub fn run_stub<P: Port>(
    mut channel: CommandChannel<P>,
    profile: &ChipProfile,
    image: &StubImage,
) -> Result<(CommandChannel<P>, ChipProfile)> {
    if image.entry == 0 {
        return Err(Error::Stub("stub has no entry point".into()));
    }
    info!("Uploading flasher stub");
    let block_size = profile.ram_write_size;

    for segment in image.segments()? {
        let size = u32::try_from(segment.bytes.len())
            .map_err(|_| Error::Stub(format!("{} segment too large", segment.name)))?;
        let blocks = size.div_ceil(block_size);
        debug!(
            "Writing {size} byte stub {} segment at 0x{:08X} in {blocks} block(s)",
            segment.name, segment.address
        );

        channel.mem_begin(size, blocks, block_size, segment.address)?;
        for (seq, chunk) in (0u32..).zip(segment.bytes.chunks(block_size as usize)) {
            channel.mem_block(chunk, seq)?;
        }
    }

    channel.mem_finish(image.entry)?;
    thread::sleep(STUB_STARTUP_DELAY);

    let stub = profile.stub();
    info!("Stub running");
    Ok((channel.with_loader(stub.loader()), stub))
}
