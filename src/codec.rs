use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::{ArrayD, IxDyn};

use crate::{Slab, SlabError, SlabResult};

static NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Serialization formats for tile payloads.
///
/// Codecs are probed in registry order against a value; the first one whose
/// detector accepts wins, with [`Codec::Object`] as the universal fallback.
/// The selected tag is embedded in the tile filename
/// (`<stack_level>.<tag>.<extension>`) so the reader can decode without
/// sniffing payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Dense numeric tiles in NumPy `.npy` v1.0 format, `<f8` little-endian.
    Dense,
    /// Generic structured tiles as a JSON document.
    Object,
}

impl Codec {
    /// Probe order for [`Codec::detect`].
    pub const REGISTRY: [Codec; 2] = [Codec::Dense, Codec::Object];

    /// Pick the first registered codec that accepts `slab`.
    #[must_use]
    pub fn detect(slab: &Slab) -> Codec {
        for codec in Self::REGISTRY {
            if codec.accepts(slab) {
                return codec;
            }
        }
        Codec::Object
    }

    fn accepts(self, slab: &Slab) -> bool {
        match self {
            Codec::Dense => matches!(slab, Slab::Dense(_)),
            Codec::Object => true,
        }
    }

    /// The tag embedded in tile filenames.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Codec::Dense => "dense",
            Codec::Object => "object",
        }
    }

    /// The tile file extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Dense => "npy",
            Codec::Object => "json",
        }
    }

    /// Look a codec up by its filename tag.
    pub fn from_tag(tag: &str) -> SlabResult<Codec> {
        Self::REGISTRY
            .into_iter()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| SlabError::UnsupportedType(format!("unknown codec tag {tag:?}")))
    }

    /// Serialize a tile payload.
    pub fn encode(self, slab: &Slab) -> SlabResult<Vec<u8>> {
        match (self, slab) {
            (Codec::Dense, Slab::Dense(a)) => Ok(encode_npy(a)),
            (Codec::Object, Slab::Object(v)) => Ok(serde_json::to_vec(v)?),
            (codec, slab) => Err(SlabError::UnsupportedType(format!(
                "{} codec cannot encode a {} value",
                codec.tag(),
                slab.kind_tag()
            ))),
        }
    }

    /// Deserialize a tile payload.
    pub fn decode(self, bytes: Bytes) -> SlabResult<Slab> {
        match self {
            Codec::Dense => decode_npy(bytes),
            Codec::Object => Ok(Slab::Object(serde_json::from_slice(&bytes)?)),
        }
    }
}

fn npy_shape_literal(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [d] => format!("({d},)"),
        dims => {
            let joined = dims
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("({joined})")
        }
    }
}

fn encode_npy(a: &ArrayD<f64>) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        npy_shape_literal(a.shape())
    );
    // Pad the header with spaces so the data section starts 64-byte aligned,
    // terminated by a newline.
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    header.push_str(&" ".repeat(unpadded.next_multiple_of(64) - unpadded));
    header.push('\n');

    let mut buf = BytesMut::with_capacity(NPY_MAGIC.len() + 4 + header.len() + a.len() * 8);
    buf.put_slice(NPY_MAGIC);
    buf.put_u8(1);
    buf.put_u8(0);
    buf.put_u16_le(header.len() as u16);
    buf.put_slice(header.as_bytes());
    for x in a.iter() {
        buf.put_f64_le(*x);
    }
    buf.to_vec()
}

fn decode_npy(mut bytes: Bytes) -> SlabResult<Slab> {
    if bytes.len() < NPY_MAGIC.len() + 4 || &bytes[..NPY_MAGIC.len()] != NPY_MAGIC {
        return Err(SlabError::UnsupportedType("not an npy payload".into()));
    }
    bytes.advance(NPY_MAGIC.len());
    let major = bytes.get_u8();
    bytes.advance(1); // minor version
    let header_len = match major {
        1 => usize::from(bytes.get_u16_le()),
        2 if bytes.remaining() >= 4 => bytes.get_u32_le() as usize,
        v => {
            return Err(SlabError::UnsupportedType(format!(
                "unsupported npy version {v}"
            )));
        }
    };
    if bytes.remaining() < header_len {
        return Err(SlabError::UnsupportedType("truncated npy header".into()));
    }
    let header = bytes.split_to(header_len);
    let header = std::str::from_utf8(&header)
        .map_err(|_| SlabError::UnsupportedType("non-utf8 npy header".into()))?;

    if !header.contains("'<f8'") {
        return Err(SlabError::UnsupportedType(
            "only little-endian f64 npy tiles are supported".into(),
        ));
    }
    if header.contains("'fortran_order': True") {
        return Err(SlabError::UnsupportedType(
            "fortran-order npy tiles are not supported".into(),
        ));
    }
    let shape = parse_npy_shape(header)?;

    let count: usize = shape.iter().product();
    if bytes.remaining() != count * 8 {
        return Err(SlabError::UnsupportedType(format!(
            "npy payload holds {} bytes, shape {shape:?} needs {}",
            bytes.remaining(),
            count * 8
        )));
    }
    let mut data = Vec::with_capacity(count);
    while bytes.remaining() >= 8 {
        data.push(bytes.get_f64_le());
    }
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map(Slab::Dense)
        .map_err(|e| SlabError::UnsupportedType(format!("npy shape: {e}")))
}

fn parse_npy_shape(header: &str) -> SlabResult<Vec<usize>> {
    let open = header
        .find('(')
        .ok_or_else(|| SlabError::UnsupportedType("npy header without shape".into()))?;
    let close = header[open..]
        .find(')')
        .ok_or_else(|| SlabError::UnsupportedType("unterminated npy shape".into()))?;
    header[open + 1..open + close]
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| SlabError::UnsupportedType(format!("bad npy extent {part:?}")))
        })
        .collect()
}
