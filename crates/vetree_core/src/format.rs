//! Binary artifact layout.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("VTRA")
//! 4       2     Format version (LE)
//! 6       2     Reserved
//! 8       8     Node count (LE)
//! 16      8     Number of features (LE)
//! 24      8     Number of classes (LE)
//! 32      8     Metadata length in bytes (LE)
//! 40      32    BLAKE3 digest of the body
//! 72      ...   Body: node records, value table, bincode metadata
//! ```
//!
//! Version 2 node records are 57 bytes: left child (i64), right child (i64),
//! split feature (i64), threshold (f64), impurity (f64), sample count (i64),
//! weighted sample count (f64), missing-direction flag (u8). Version 1 is the
//! same without the trailing flag and is only read by the migrator.

use crate::errors::{Result, VetreeError};
use crate::tree::{MissingDirection, TreeNode};

/// Magic bytes identifying an artifact file.
pub const MAGIC: &[u8; 4] = b"VTRA";

/// Version written by this crate.
pub const CURRENT_FORMAT_VERSION: u16 = 2;

/// Version without the missing-direction column.
pub const LEGACY_FORMAT_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 72;

pub const NODE_RECORD_SIZE: usize = 57;

pub const LEGACY_NODE_RECORD_SIZE: usize = 56;

/// Fixed-size header preceding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub version: u16,
    pub node_count: u64,
    pub n_features: u64,
    pub n_classes: u64,
    pub metadata_len: u64,
    pub checksum: [u8; 32],
}

impl FormatHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // 6..8 reserved
        buf[8..16].copy_from_slice(&self.node_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.n_features.to_le_bytes());
        buf[24..32].copy_from_slice(&self.n_classes.to_le_bytes());
        buf[32..40].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf[40..72].copy_from_slice(&self.checksum);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(VetreeError::corrupt(format!(
                "file truncated: header needs {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if !has_magic(bytes) {
            return Err(VetreeError::corrupt("not a vetree artifact (bad magic)"));
        }
        let mut reader = ByteReader::new(&bytes[4..HEADER_SIZE]);
        let version = reader.u16()?;
        reader.skip(2)?;
        let node_count = reader.u64()?;
        let n_features = reader.u64()?;
        let n_classes = reader.u64()?;
        let metadata_len = reader.u64()?;
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(reader.take(32)?);

        Ok(Self {
            version,
            node_count,
            n_features,
            n_classes,
            metadata_len,
            checksum,
        })
    }

    /// Size of a node record for this header's version.
    pub fn record_size(&self) -> Result<usize> {
        match self.version {
            CURRENT_FORMAT_VERSION => Ok(NODE_RECORD_SIZE),
            LEGACY_FORMAT_VERSION => Ok(LEGACY_NODE_RECORD_SIZE),
            other => Err(VetreeError::corrupt(format!(
                "unsupported artifact format version {other}"
            ))),
        }
    }

    /// Expected body length, or an error if the counts overflow.
    pub fn body_len(&self) -> Result<usize> {
        let overflow = || VetreeError::corrupt("header counts overflow the addressable size");
        let nodes = to_usize(self.node_count)?
            .checked_mul(self.record_size()?)
            .ok_or_else(overflow)?;
        let values = to_usize(self.node_count)?
            .checked_mul(to_usize(self.n_classes)?)
            .and_then(|v| v.checked_mul(8))
            .ok_or_else(overflow)?;
        nodes
            .checked_add(values)
            .and_then(|v| v.checked_add(to_usize(self.metadata_len).ok()?))
            .ok_or_else(overflow)
    }
}

/// True when `bytes` starts with the artifact magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

/// Raw sections of a binary artifact after header and checksum checks.
#[derive(Debug, Clone)]
pub struct RawArtifact<'a> {
    pub header: FormatHeader,
    pub nodes: Vec<TreeNode>,
    pub values: Vec<f64>,
    pub metadata: &'a [u8],
}

/// Split a binary artifact of either version into its sections, verifying
/// length and checksum. Version 1 records get the default missing direction.
pub fn read_sections(bytes: &[u8]) -> Result<RawArtifact<'_>> {
    let header = FormatHeader::from_bytes(bytes)?;
    let record_size = header.record_size()?;
    let expected = header.body_len()?;
    let body = &bytes[HEADER_SIZE..];

    if body.len() != expected {
        return Err(VetreeError::corrupt(format!(
            "body is {} bytes, header describes {expected}",
            body.len()
        )));
    }
    let digest = blake3::hash(body);
    if digest.as_bytes() != &header.checksum {
        return Err(VetreeError::corrupt(format!(
            "checksum mismatch: header {}, body {}",
            hex::encode(header.checksum),
            digest.to_hex()
        )));
    }

    let node_count = to_usize(header.node_count)?;
    let value_count = node_count * to_usize(header.n_classes)?;
    let mut reader = ByteReader::new(body);

    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let record = reader.take(record_size)?;
        nodes.push(decode_node(record, i)?);
    }

    let mut values = Vec::with_capacity(value_count);
    for _ in 0..value_count {
        values.push(reader.f64()?);
    }

    let metadata = reader.take(to_usize(header.metadata_len)?)?;

    Ok(RawArtifact {
        header,
        nodes,
        values,
        metadata,
    })
}

/// Assemble a complete file image for the given version.
pub fn write_sections(
    version: u16,
    nodes: &[TreeNode],
    values: &[f64],
    n_features: usize,
    n_classes: usize,
    metadata: &[u8],
) -> Result<Vec<u8>> {
    let record_size = match version {
        CURRENT_FORMAT_VERSION => NODE_RECORD_SIZE,
        LEGACY_FORMAT_VERSION => LEGACY_NODE_RECORD_SIZE,
        other => {
            return Err(VetreeError::corrupt(format!(
                "cannot write format version {other}"
            )))
        }
    };

    let mut body = Vec::with_capacity(nodes.len() * record_size + values.len() * 8 + metadata.len());
    for node in nodes {
        encode_node(node, record_size, &mut body);
    }
    for v in values {
        body.extend_from_slice(&v.to_le_bytes());
    }
    body.extend_from_slice(metadata);

    let header = FormatHeader {
        version,
        node_count: nodes.len() as u64,
        n_features: n_features as u64,
        n_classes: n_classes as u64,
        metadata_len: metadata.len() as u64,
        checksum: *blake3::hash(&body).as_bytes(),
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_node(node: &TreeNode, record_size: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&node.left_child.to_le_bytes());
    out.extend_from_slice(&node.right_child.to_le_bytes());
    out.extend_from_slice(&node.split_feature.to_le_bytes());
    out.extend_from_slice(&node.threshold.to_le_bytes());
    out.extend_from_slice(&node.impurity.to_le_bytes());
    out.extend_from_slice(&node.sample_count.to_le_bytes());
    out.extend_from_slice(&node.weighted_sample_count.to_le_bytes());
    if record_size == NODE_RECORD_SIZE {
        out.push(node.missing_direction.to_flag());
    }
}

fn decode_node(record: &[u8], idx: usize) -> Result<TreeNode> {
    let mut reader = ByteReader::new(record);
    let left_child = reader.i64()?;
    let right_child = reader.i64()?;
    let split_feature = reader.i64()?;
    let threshold = reader.f64()?;
    let impurity = reader.f64()?;
    let sample_count = reader.i64()?;
    let weighted_sample_count = reader.f64()?;
    let missing_direction = if record.len() == NODE_RECORD_SIZE {
        let flag = reader.u8()?;
        MissingDirection::from_flag(flag).ok_or_else(|| {
            VetreeError::corrupt(format!("node {idx} has invalid missing-direction flag {flag}"))
        })?
    } else {
        MissingDirection::default()
    };

    Ok(TreeNode {
        left_child,
        right_child,
        split_feature,
        threshold,
        impurity,
        sample_count,
        weighted_sample_count,
        missing_direction,
    })
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| VetreeError::corrupt(format!("count {value} too large")))
}

/// Little-endian cursor over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                VetreeError::corrupt(format!(
                    "unexpected end of data at offset {} (wanted {n} bytes)",
                    self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}
