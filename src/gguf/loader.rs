/// Loads a GGUF file into a `Model`: parses magic/version/metadata/tensor
/// records, wraps tensor bytes as `Weight` without re-quantizing, and
/// assembles `ModelConfig` and `Tokenizer` from the metadata map.
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use half::f16;
use memmap2::Mmap;

use crate::error::{SmallMindError, SmallMindResult};
use crate::gguf::format::{GgufDType, GgufHeader, GgufValue, GgufValueType, TensorInfo, GGUF_MAGIC};
use crate::model::{Activation, Model, ModelConfig, NormKind};
use crate::quant::{QuantScheme, QuantizedTensor, Weight};
use crate::tensor::Tensor;
use crate::tokenizer::Tokenizer;

/// Byte cursor over the memory-mapped file, tracking a read position.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> SmallMindResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(SmallMindError::InvalidFormat(
                "unexpected end of file".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u32(&mut self) -> SmallMindResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> SmallMindResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i8(&mut self) -> SmallMindResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    fn u8(&mut self) -> SmallMindResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> SmallMindResult<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u16(&mut self) -> SmallMindResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> SmallMindResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> SmallMindResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> SmallMindResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> SmallMindResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> SmallMindResult<String> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SmallMindError::InvalidFormat("metadata string is not valid utf-8".to_string()))
    }

    fn value(&mut self) -> SmallMindResult<GgufValue> {
        let type_code = self.u32()?;
        self.value_of_type(GgufValueType::from_u32(type_code)?)
    }

    fn value_of_type(&mut self, ty: GgufValueType) -> SmallMindResult<GgufValue> {
        Ok(match ty {
            GgufValueType::U8 => GgufValue::U8(self.u8()?),
            GgufValueType::I8 => GgufValue::I8(self.i8()?),
            GgufValueType::U16 => GgufValue::U16(self.u16()?),
            GgufValueType::I16 => GgufValue::I16(self.i16()?),
            GgufValueType::U32 => GgufValue::U32(self.u32()?),
            GgufValueType::I32 => GgufValue::I32(self.i32()?),
            GgufValueType::F32 => GgufValue::F32(self.f32()?),
            GgufValueType::Bool => GgufValue::Bool(self.u8()? != 0),
            GgufValueType::String => GgufValue::String(self.string()?),
            GgufValueType::U64 => GgufValue::U64(self.u64()?),
            GgufValueType::I64 => GgufValue::I64(self.i64()?),
            GgufValueType::F64 => GgufValue::F64(self.f64()?),
            GgufValueType::Array => {
                let elem_type = GgufValueType::from_u32(self.u32()?)?;
                let count = self.u64()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value_of_type(elem_type)?);
                }
                GgufValue::Array(items)
            }
        })
    }
}

fn read_header(cursor: &mut Cursor) -> SmallMindResult<GgufHeader> {
    let magic = cursor.take(4)?;
    if magic != GGUF_MAGIC {
        return Err(SmallMindError::InvalidFormat(
            "missing GGUF magic".to_string(),
        ));
    }
    let version = cursor.u32()?;
    let tensor_count = cursor.u64()?;
    let metadata_kv_count = cursor.u64()?;
    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_metadata(cursor: &mut Cursor, count: u64) -> SmallMindResult<HashMap<String, GgufValue>> {
    let mut metadata = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = cursor.string()?;
        let value = cursor.value()?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn read_tensor_infos(cursor: &mut Cursor, count: u64) -> SmallMindResult<Vec<TensorInfo>> {
    let mut infos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = cursor.string()?;
        let n_dims = cursor.u32()? as usize;
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(cursor.u64()?);
        }
        let dtype = GgufDType::from_u32(cursor.u32()?)?;
        let offset = cursor.u64()?;
        infos.push(TensorInfo {
            name,
            dims,
            dtype,
            offset,
        });
    }
    Ok(infos)
}

fn get_u64(metadata: &HashMap<String, GgufValue>, key: &str) -> Option<u64> {
    metadata.get(key).and_then(|v| v.as_u64())
}

fn get_f32(metadata: &HashMap<String, GgufValue>, key: &str) -> Option<f32> {
    metadata.get(key).and_then(|v| v.as_f32())
}

fn get_str<'a>(metadata: &'a HashMap<String, GgufValue>, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.as_str())
}

fn build_tokenizer(metadata: &HashMap<String, GgufValue>) -> Tokenizer {
    let vocab: Vec<String> = metadata
        .get("tokenizer.ggml.tokens")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let merges: Vec<(String, String)> = metadata
        .get("tokenizer.ggml.merges")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| {
                    let mut parts = s.splitn(2, ' ');
                    Some((parts.next()?.to_string(), parts.next()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Tokenizer::new(vocab, merges)
}

fn detect_architecture_defaults(arch: &str) -> (Activation, NormKind) {
    let lower = arch.to_lowercase();
    if lower.contains("phi") {
        (Activation::Gelu, NormKind::LayerNorm)
    } else {
        (Activation::SwiGlu, NormKind::RmsNorm)
    }
}

fn build_config(metadata: &HashMap<String, GgufValue>, path: &Path) -> SmallMindResult<ModelConfig> {
    let arch = get_str(metadata, "general.architecture")
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string()
        });

    let n_layers = get_u64(metadata, &format!("{arch}.block_count")).ok_or_else(|| {
        SmallMindError::UnsupportedArchitecture(format!("missing block_count for {arch}"))
    })? as usize;
    let d_model = get_u64(metadata, &format!("{arch}.embedding_length"))
        .ok_or_else(|| SmallMindError::UnsupportedArchitecture(format!("missing embedding_length for {arch}")))?
        as usize;
    let n_heads = get_u64(metadata, &format!("{arch}.attention.head_count"))
        .ok_or_else(|| SmallMindError::UnsupportedArchitecture(format!("missing head_count for {arch}")))?
        as usize;
    // n_kv_heads = n_heads if unspecified: detects GQA when the file does
    // carry a distinct head_count_kv.
    let n_kv_heads = get_u64(metadata, &format!("{arch}.attention.head_count_kv")).unwrap_or(n_heads as u64) as usize;
    let head_dim = get_u64(metadata, &format!("{arch}.attention.key_length"))
        .map(|v| v as usize)
        .unwrap_or(d_model / n_heads.max(1));
    let ffn_hidden = get_u64(metadata, &format!("{arch}.feed_forward_length")).unwrap_or((d_model * 4) as u64) as usize;
    let rope_theta = get_f32(metadata, &format!("{arch}.rope.freq_base")).unwrap_or(10000.0);
    let max_context = get_u64(metadata, &format!("{arch}.context_length")).unwrap_or(2048) as usize;
    let vocab_size = metadata
        .get("tokenizer.ggml.tokens")
        .and_then(|v| v.as_array())
        .map(|arr| arr.len())
        .or_else(|| get_u64(metadata, &format!("{arch}.vocab_size")).map(|v| v as usize))
        .unwrap_or(0);
    let eos_id = get_u64(metadata, "tokenizer.ggml.eos_token_id").unwrap_or(0) as u32;
    let bos_id = get_u64(metadata, "tokenizer.ggml.bos_token_id").unwrap_or(0) as u32;
    let chat_template = get_str(metadata, "tokenizer.chat_template").map(str::to_string);
    let sliding_window = get_u64(metadata, &format!("{arch}.attention.sliding_window")).map(|v| v as usize);

    let (activation, norm) = detect_architecture_defaults(&arch);

    Ok(ModelConfig {
        arch,
        n_layers,
        d_model,
        n_heads,
        n_kv_heads,
        head_dim,
        ffn_hidden,
        activation,
        norm,
        rope_theta,
        max_context,
        vocab_size,
        eos_id,
        bos_id,
        chat_template,
        sliding_window,
    })
}

fn tensor_element_count(dims: &[u64]) -> usize {
    dims.iter().product::<u64>() as usize
}

fn wrap_tensor(info: &TensorInfo, bytes: &[u8]) -> SmallMindResult<Weight> {
    let total_elems = tensor_element_count(&info.dims);
    // GGUF dims are stored fastest-varying first; our row-major Tensor/
    // QuantizedTensor want [rows, cols] slowest-varying first.
    let mut shape: Vec<usize> = info.dims.iter().rev().map(|&d| d as usize).collect();
    if shape.is_empty() {
        shape.push(total_elems);
    }

    match info.dtype {
        GgufDType::F32 => {
            if bytes.len() != total_elems * 4 {
                return Err(SmallMindError::ShapeMismatch(format!(
                    "tensor {} byte length mismatch",
                    info.name
                )));
            }
            let data: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Ok(Weight::DenseF32(Tensor::new(shape, data)))
        }
        GgufDType::F16 => {
            if bytes.len() != total_elems * 2 {
                return Err(SmallMindError::ShapeMismatch(format!(
                    "tensor {} byte length mismatch",
                    info.name
                )));
            }
            let data: Vec<f32> = bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            Ok(Weight::DenseF32(Tensor::new(shape, data)))
        }
        quant_dtype => {
            let scheme = match quant_dtype {
                GgufDType::Q4_0 => QuantScheme::Q4_0,
                GgufDType::Q4_1 => QuantScheme::Q4_1,
                GgufDType::Q5_0 => QuantScheme::Q5_0,
                GgufDType::Q8_0 => QuantScheme::Q8_0,
                GgufDType::Q4K => QuantScheme::Q4K,
                GgufDType::Q6K => QuantScheme::Q6K,
                GgufDType::F32 | GgufDType::F16 => unreachable!(),
            };
            let (rows, cols) = if shape.len() >= 2 {
                (shape[0], shape[1..].iter().product())
            } else {
                (1, shape[0])
            };
            let tensor = QuantizedTensor::new(scheme, rows, cols, bytes.to_vec())?;
            Ok(Weight::Quantized(tensor))
        }
    }
}

const DEFAULT_ALIGNMENT: u64 = 32;

/// Parse a GGUF file in full and assemble the in-memory `Model`.
pub fn load_model(path: &Path) -> SmallMindResult<Model> {
    let start = Instant::now();
    let file = File::open(path)?;
    // SAFETY: the file is not expected to be concurrently truncated by
    // another process during load; this is the standard memmap2 caveat.
    let mmap = unsafe { Mmap::map(&file)? };

    let mut cursor = Cursor::new(&mmap);
    let header = read_header(&mut cursor)?;
    let metadata = read_metadata(&mut cursor, header.metadata_kv_count)?;
    let tensor_infos = read_tensor_infos(&mut cursor, header.tensor_count)?;

    let alignment = get_u64(&metadata, "general.alignment").unwrap_or(DEFAULT_ALIGNMENT);
    let data_start = cursor.pos as u64;
    let padded_start = data_start.div_ceil(alignment) * alignment;

    let mut weights = BTreeMap::new();
    for info in &tensor_infos {
        let abs_offset = padded_start + info.offset;
        let elem_count = tensor_element_count(&info.dims);
        let byte_len = match info.dtype {
            GgufDType::F32 => elem_count * 4,
            GgufDType::F16 => elem_count * 2,
            GgufDType::Q4_0 => elem_count / 32 * 18,
            GgufDType::Q4_1 => elem_count / 32 * 20,
            GgufDType::Q5_0 => elem_count / 32 * 22,
            GgufDType::Q8_0 => elem_count / 32 * 34,
            GgufDType::Q4K => elem_count / 256 * 144,
            GgufDType::Q6K => elem_count / 256 * 210,
        };
        let start_idx = abs_offset as usize;
        let end_idx = start_idx + byte_len;
        if end_idx > mmap.len() {
            return Err(SmallMindError::InvalidFormat(format!(
                "tensor {} extends past end of file",
                info.name
            )));
        }
        let bytes = &mmap[start_idx..end_idx];
        weights.insert(info.name.clone(), wrap_tensor(info, bytes)?);
    }

    let config = build_config(&metadata, path)?;
    let tokenizer = build_tokenizer(&metadata);
    let mut model = Model::new(config, weights, tokenizer);

    if model.config.sliding_window.is_some() {
        let msg = format!(
            "sliding window attention detected in {} metadata but is not enforced by the forward pass",
            model.config.arch
        );
        tracing::warn!("{msg}");
        model.push_warning(msg);
    }

    tracing::info!(
        file = %path.display(),
        tensors = tensor_infos.len(),
        load_ms = start.elapsed().as_millis(),
        "loaded GGUF model"
    );

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Builds a minimal single-tensor F32 GGUF file and checks the loader
    /// reproduces its config and tensor bytes.
    #[test]
    fn loads_minimal_f32_model() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&5u64.to_le_bytes()); // metadata_kv_count

        write_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&(GgufValueType::String as u32).to_le_bytes());
        write_string(&mut buf, "llama");

        write_string(&mut buf, "llama.block_count");
        buf.extend_from_slice(&(GgufValueType::U32 as u32).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());

        write_string(&mut buf, "llama.embedding_length");
        buf.extend_from_slice(&(GgufValueType::U32 as u32).to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());

        write_string(&mut buf, "llama.attention.head_count");
        buf.extend_from_slice(&(GgufValueType::U32 as u32).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());

        write_string(&mut buf, "llama.context_length");
        buf.extend_from_slice(&(GgufValueType::U32 as u32).to_le_bytes());
        buf.extend_from_slice(&128u32.to_le_bytes());

        write_string(&mut buf, "weight");
        buf.extend_from_slice(&2u32.to_le_bytes()); // n_dims
        buf.extend_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // dtype F32
        buf.extend_from_slice(&0u64.to_le_bytes()); // offset

        let pre_pad_len = buf.len() as u64;
        let padded = pre_pad_len.div_ceil(DEFAULT_ALIGNMENT) * DEFAULT_ALIGNMENT;
        buf.resize(padded as usize, 0);

        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        for v in &data {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&buf).unwrap();

        let model = load_model(tmp.path()).unwrap();
        assert_eq!(model.config.arch, "llama");
        assert_eq!(model.config.n_layers, 1);
        assert_eq!(model.config.d_model, 4);
        assert_eq!(model.config.max_context, 128);

        match model.weight("weight").unwrap() {
            Weight::DenseF32(t) => assert_eq!(t.as_slice(), data.as_slice()),
            _ => panic!("expected dense weight"),
        }
    }
}
