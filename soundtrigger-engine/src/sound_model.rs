/// Sound model repacking
///
/// Vendor sound models arrive as a keyphrase (or generic) container whose
/// payload may itself be a multi-model bundle. The detection accelerator only
/// takes a single flat model, so [`repack`] pulls the keyword-detection
/// sub-model out and rewrites the header to point at it.
///
/// All records are little-endian and decoded field by field from byte
/// slices; truncated or out-of-range input is rejected as
/// [`EngineError::InvalidArgument`].
///
/// Layout of a container:
///
/// ```text
/// +---------------------------+  0
/// | common header (44)        |  kind, uuid, vendor uuid, data_size, data_offset
/// | phrase table (keyphrase)  |  num_phrases + 10 phrase records
/// +---------------------------+  data_offset
/// | payload                   |  model, or multi-model bundle:
/// |   global header (12)      |
/// |   v3 header (8)           |
/// |   descriptors (16 * N)    |
/// |   sub-model payloads      |  descriptor offsets are relative to here
/// +---------------------------+
/// ```

use crate::error::{EngineError, Result};
use std::ops::Range;
use tracing::{debug, warn};

/// Size of the common sound model header
pub const COMMON_HEADER_SIZE: usize = 44;

/// Phrase records carried by a keyphrase header
pub const MAX_PHRASES: usize = 10;

/// User ids per phrase record
pub const MAX_USERS: usize = 10;

const LOCALE_LEN: usize = 16;
const TEXT_LEN: usize = 64;

/// Size of one phrase record
pub const PHRASE_RECORD_SIZE: usize = 12 + 4 * MAX_USERS + LOCALE_LEN + TEXT_LEN;

/// Size of the keyphrase header (common header + phrase table)
pub const PHRASE_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4 + MAX_PHRASES * PHRASE_RECORD_SIZE;

pub const SML_GLOBAL_HEADER_SIZE: usize = 12;
pub const SML_HEADER_V3_SIZE: usize = 8;
pub const SML_DESCRIPTOR_SIZE: usize = 16;

pub const SML_GLOBAL_HEADER_MAGIC: u32 = 0x0018_0CC8;
pub const SML_HEADER_VERSION_V3: u32 = 3;

/// Sub-model type of the first-stage keyword detector
pub const SUB_MODEL_KEYWORD_GMM: u32 = 0x0001;

const DATA_SIZE_AT: usize = 36;
const DATA_OFFSET_AT: usize = 40;

fn field<const N: usize>(buf: &[u8], at: usize, what: &str) -> Result<[u8; N]> {
    at.checked_add(N)
        .and_then(|end| buf.get(at..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            EngineError::invalid(format!(
                "truncated {} at offset {} (container is {} bytes)",
                what,
                at,
                buf.len()
            ))
        })
}

fn read_u32(buf: &[u8], at: usize, what: &str) -> Result<u32> {
    field::<4>(buf, at, what).map(u32::from_le_bytes)
}

fn read_u16(buf: &[u8], at: usize, what: &str) -> Result<u16> {
    field::<2>(buf, at, what).map(u16::from_le_bytes)
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut [u8], text: &str) {
    // Always leave a terminating NUL
    let len = text.len().min(out.len() - 1);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| EngineError::invalid(format!("{} too large: {}", what, value)))
}

/// Top-level container type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundModelKind {
    Keyphrase,
    Generic,
}

impl SoundModelKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SoundModelKind::Keyphrase),
            1 => Some(SoundModelKind::Generic),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            SoundModelKind::Keyphrase => 0,
            SoundModelKind::Generic => 1,
        }
    }

    /// Bytes of header that precede the payload in a flattened model
    pub fn header_size(self) -> usize {
        match self {
            SoundModelKind::Keyphrase => PHRASE_HEADER_SIZE,
            SoundModelKind::Generic => COMMON_HEADER_SIZE,
        }
    }
}

/// Common header shared by every container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundModelHeader {
    pub kind: SoundModelKind,
    pub uuid: [u8; 16],
    pub vendor_uuid: [u8; 16],
    pub data_size: u32,
    pub data_offset: u32,
}

impl SoundModelHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let raw_kind = read_u32(buf, 0, "sound model type")?;
        let kind = SoundModelKind::from_raw(raw_kind)
            .ok_or_else(|| EngineError::invalid(format!("unknown sound model type {}", raw_kind)))?;

        Ok(Self {
            kind,
            uuid: field(buf, 4, "uuid")?,
            vendor_uuid: field(buf, 20, "vendor uuid")?,
            data_size: read_u32(buf, DATA_SIZE_AT, "data size")?,
            data_offset: read_u32(buf, DATA_OFFSET_AT, "data offset")?,
        })
    }

    pub fn encode(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut out = [0u8; COMMON_HEADER_SIZE];
        put_u32(&mut out, 0, self.kind.as_raw());
        out[4..20].copy_from_slice(&self.uuid);
        out[20..36].copy_from_slice(&self.vendor_uuid);
        put_u32(&mut out, DATA_SIZE_AT, self.data_size);
        put_u32(&mut out, DATA_OFFSET_AT, self.data_offset);
        out
    }

    fn payload_range(&self) -> Range<usize> {
        let start = self.data_offset as usize;
        start..start + self.data_size as usize
    }
}

/// One entry of the keyphrase phrase table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyphraseRecord {
    pub id: u32,
    pub recognition_mode: u32,
    pub users: Vec<u32>,
    pub locale: String,
    pub text: String,
}

impl KeyphraseRecord {
    pub fn encode(&self) -> Result<[u8; PHRASE_RECORD_SIZE]> {
        if self.users.len() > MAX_USERS {
            return Err(EngineError::invalid(format!(
                "phrase {} has {} users, at most {} supported",
                self.id,
                self.users.len(),
                MAX_USERS
            )));
        }

        let mut out = [0u8; PHRASE_RECORD_SIZE];
        put_u32(&mut out, 0, self.id);
        put_u32(&mut out, 4, self.recognition_mode);
        put_u32(&mut out, 8, self.users.len() as u32);
        for (i, user) in self.users.iter().enumerate() {
            put_u32(&mut out, 12 + 4 * i, *user);
        }

        let locale_at = 12 + 4 * MAX_USERS;
        put_str(&mut out[locale_at..locale_at + LOCALE_LEN], &self.locale);
        put_str(&mut out[locale_at + LOCALE_LEN..], &self.text);
        Ok(out)
    }
}

/// Multi-model bundle header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmlGlobalHeader {
    pub magic: u32,
    pub payload_bytes: u32,
    pub header_version: u32,
}

impl SmlGlobalHeader {
    pub fn decode(buf: &[u8], at: usize) -> Result<Self> {
        Ok(Self {
            magic: read_u32(buf, at, "bundle magic")?,
            payload_bytes: read_u32(buf, at + 4, "bundle payload size")?,
            header_version: read_u32(buf, at + 8, "bundle header version")?,
        })
    }

    pub fn encode(&self) -> [u8; SML_GLOBAL_HEADER_SIZE] {
        let mut out = [0u8; SML_GLOBAL_HEADER_SIZE];
        put_u32(&mut out, 0, self.magic);
        put_u32(&mut out, 4, self.payload_bytes);
        put_u32(&mut out, 8, self.header_version);
        out
    }
}

/// Describes one sub-model inside a multi-model bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubModelDescriptor {
    pub version_major: u16,
    pub version_minor: u16,
    /// Offset relative to the end of the descriptor table
    pub offset: u32,
    pub size: u32,
    pub kind: u32,
}

impl SubModelDescriptor {
    pub fn decode(buf: &[u8], at: usize) -> Result<Self> {
        Ok(Self {
            version_major: read_u16(buf, at, "descriptor version")?,
            version_minor: read_u16(buf, at + 2, "descriptor version")?,
            offset: read_u32(buf, at + 4, "descriptor offset")?,
            size: read_u32(buf, at + 8, "descriptor size")?,
            kind: read_u32(buf, at + 12, "descriptor type")?,
        })
    }

    pub fn encode(&self) -> [u8; SML_DESCRIPTOR_SIZE] {
        let mut out = [0u8; SML_DESCRIPTOR_SIZE];
        out[0..2].copy_from_slice(&self.version_major.to_le_bytes());
        out[2..4].copy_from_slice(&self.version_minor.to_le_bytes());
        put_u32(&mut out, 4, self.offset);
        put_u32(&mut out, 8, self.size);
        put_u32(&mut out, 12, self.kind);
        out
    }
}

/// Flattened single-model blob, ready to hand to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundModel {
    bytes: Vec<u8>,
    kind: SoundModelKind,
    num_phrases: u32,
}

impl SoundModel {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> SoundModelKind {
        self.kind
    }

    /// Phrases declared by the model (zero for generic models)
    pub fn num_phrases(&self) -> u32 {
        self.num_phrases
    }

    /// Model payload following the header
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.kind.header_size()..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Flatten a raw container into a single-model blob
///
/// With `sub_model_count > 1` the keyphrase payload is treated as a
/// multi-model bundle and the keyword-detection sub-model is extracted.
pub fn repack(raw: &[u8], sub_model_count: u32) -> Result<SoundModel> {
    if raw.is_empty() {
        return Err(EngineError::invalid("empty sound model data"));
    }
    if sub_model_count == 0 {
        return Err(EngineError::invalid("sub-model count must be at least 1"));
    }

    let header = SoundModelHeader::decode(raw)?;
    let header_size = header.kind.header_size();
    if raw.len() < header_size {
        return Err(EngineError::invalid(format!(
            "{:?} sound model needs a {} byte header, got {} bytes",
            header.kind,
            header_size,
            raw.len()
        )));
    }

    let (num_phrases, payload) = match header.kind {
        SoundModelKind::Keyphrase => {
            let num_phrases = read_u32(raw, COMMON_HEADER_SIZE, "phrase count")?;
            if num_phrases as usize > MAX_PHRASES {
                return Err(EngineError::invalid(format!(
                    "sound model declares {} phrases, at most {} supported",
                    num_phrases, MAX_PHRASES
                )));
            }

            let range = if sub_model_count > 1 {
                locate_keyword_sub_model(raw, header.data_offset as usize, sub_model_count as usize)?
            } else {
                header.payload_range()
            };
            (num_phrases, slice(raw, range)?)
        }
        SoundModelKind::Generic => (0, slice(raw, header.payload_range())?),
    };

    let mut bytes = Vec::with_capacity(header_size + payload.len());
    bytes.extend_from_slice(&raw[..header_size]);
    bytes.extend_from_slice(payload);
    put_u32(&mut bytes, DATA_SIZE_AT, to_u32(payload.len(), "payload")?);
    put_u32(&mut bytes, DATA_OFFSET_AT, header_size as u32);

    debug!(
        "Repacked {:?} sound model: {} -> {} bytes ({} phrases)",
        header.kind,
        raw.len(),
        bytes.len(),
        num_phrases
    );

    Ok(SoundModel {
        bytes,
        kind: header.kind,
        num_phrases,
    })
}

fn slice(raw: &[u8], range: Range<usize>) -> Result<&[u8]> {
    raw.get(range.clone()).ok_or_else(|| {
        EngineError::invalid(format!(
            "payload {}..{} outside container of {} bytes",
            range.start,
            range.end,
            raw.len()
        ))
    })
}

fn locate_keyword_sub_model(raw: &[u8], bundle_at: usize, count: usize) -> Result<Range<usize>> {
    let header_v3_at = bundle_at + SML_GLOBAL_HEADER_SIZE;
    let declared = read_u32(raw, header_v3_at, "bundle model count")?;
    if declared as usize != count {
        warn!(
            "Bundle declares {} sub-models, caller declared {}; using caller's count",
            declared, count
        );
    }

    let table_at = header_v3_at + SML_HEADER_V3_SIZE;
    let payloads_at = count
        .checked_mul(SML_DESCRIPTOR_SIZE)
        .and_then(|table_len| table_at.checked_add(table_len))
        .ok_or_else(|| EngineError::invalid(format!("sub-model count {} too large", count)))?;

    for index in 0..count {
        let descriptor = SubModelDescriptor::decode(raw, table_at + index * SML_DESCRIPTOR_SIZE)?;
        if descriptor.kind == SUB_MODEL_KEYWORD_GMM {
            let start = payloads_at + descriptor.offset as usize;
            debug!(
                "Keyword sub-model is entry {} of {}: {} bytes at offset {}",
                index, count, descriptor.size, start
            );
            return Ok(start..start + descriptor.size as usize);
        }
    }

    Err(EngineError::invalid(format!(
        "no keyword detection sub-model among {} entries",
        count
    )))
}

/// Identity and phrase table of a keyphrase container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyphraseModel {
    pub uuid: [u8; 16],
    pub vendor_uuid: [u8; 16],
    pub phrases: Vec<KeyphraseRecord>,
}

impl KeyphraseModel {
    /// Encode a keyphrase container with `payload` directly after the header
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.phrases.len() > MAX_PHRASES {
            return Err(EngineError::invalid(format!(
                "{} phrases, at most {} supported",
                self.phrases.len(),
                MAX_PHRASES
            )));
        }

        let header = SoundModelHeader {
            kind: SoundModelKind::Keyphrase,
            uuid: self.uuid,
            vendor_uuid: self.vendor_uuid,
            data_size: to_u32(payload.len(), "payload")?,
            data_offset: PHRASE_HEADER_SIZE as u32,
        };

        let mut out = Vec::with_capacity(PHRASE_HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&(self.phrases.len() as u32).to_le_bytes());
        for phrase in &self.phrases {
            out.extend_from_slice(&phrase.encode()?);
        }
        out.resize(PHRASE_HEADER_SIZE, 0);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Encode a generic container with `payload` directly after the header
pub fn encode_generic_model(uuid: [u8; 16], vendor_uuid: [u8; 16], payload: &[u8]) -> Result<Vec<u8>> {
    let header = SoundModelHeader {
        kind: SoundModelKind::Generic,
        uuid,
        vendor_uuid,
        data_size: to_u32(payload.len(), "payload")?,
        data_offset: COMMON_HEADER_SIZE as u32,
    };

    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a multi-model bundle from `(sub-model type, payload)` pairs
pub fn encode_bundle(models: &[(u32, &[u8])]) -> Result<Vec<u8>> {
    let table_len = models.len() * SML_DESCRIPTOR_SIZE;
    let payload_len: usize = models.iter().map(|(_, data)| data.len()).sum();
    let body_len = SML_HEADER_V3_SIZE + table_len + payload_len;

    let global = SmlGlobalHeader {
        magic: SML_GLOBAL_HEADER_MAGIC,
        payload_bytes: to_u32(body_len, "bundle")?,
        header_version: SML_HEADER_VERSION_V3,
    };

    let mut out = Vec::with_capacity(SML_GLOBAL_HEADER_SIZE + body_len);
    out.extend_from_slice(&global.encode());
    out.extend_from_slice(&to_u32(models.len(), "model count")?.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    let mut offset = 0usize;
    for (kind, data) in models {
        let descriptor = SubModelDescriptor {
            version_major: 3,
            version_minor: 0,
            offset: to_u32(offset, "sub-model offset")?,
            size: to_u32(data.len(), "sub-model")?,
            kind: *kind,
        };
        out.extend_from_slice(&descriptor.encode());
        offset += data.len();
    }

    for (_, data) in models {
        out.extend_from_slice(data);
    }
    Ok(out)
}
