//! 媒体预处理：执行前归一化二进制载荷
//!
//! schema 中标记为 Binary 的字段接受三种形式：
//! - 标准 / URL-safe base64 字符串（可带或不带 padding）
//! - `data:<mime>;base64,<payload>` 形式的 data URL
//! - 字节数组 `[137, 80, 78, 71, ...]`
//!
//! 统一改写为标准 base64，并追加同名 `<field>Meta = { mimeType, sizeBytes }`。

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Value};

use crate::capability::CapabilityDescriptor;
use crate::core::SupervisorError;

/// 归一化后的二进制载荷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBinary {
    pub base64: String,
    pub mime_type: String,
    pub size_bytes: usize,
}

/// 无状态预处理器
#[derive(Debug, Default, Clone)]
pub struct MediaPreprocessor;

impl MediaPreprocessor {
    pub fn new() -> Self {
        Self
    }

    /// 对描述中的所有 Binary 字段做归一化；字段缺失（可选字段）时跳过
    pub fn preprocess(
        &self,
        descriptor: &CapabilityDescriptor,
        mut params: Value,
    ) -> Result<Value, SupervisorError> {
        let obj = params.as_object_mut().ok_or_else(|| {
            SupervisorError::Preprocess("parameters must be a JSON object".to_string())
        })?;

        for field in descriptor.schema.binary_fields() {
            let Some(raw) = obj.get(field) else { continue };
            if raw.is_null() {
                continue;
            }
            let normalized = normalize_binary(raw)
                .map_err(|e| SupervisorError::Preprocess(format!("field '{field}': {e}")))?;
            tracing::debug!(
                field,
                mime_type = %normalized.mime_type,
                size_bytes = normalized.size_bytes,
                "binary field normalized"
            );
            obj.insert(
                format!("{field}Meta"),
                json!({
                    "mimeType": normalized.mime_type,
                    "sizeBytes": normalized.size_bytes,
                }),
            );
            obj.insert(field.to_string(), Value::String(normalized.base64));
        }

        Ok(params)
    }
}

/// 将单个二进制值解码并重新编码为标准 base64
pub fn normalize_binary(value: &Value) -> Result<NormalizedBinary, String> {
    let (bytes, declared_mime) = match value {
        Value::String(s) => decode_string(s)?,
        Value::Array(items) => (bytes_from_array(items)?, None),
        _ => return Err("expected base64 string or byte array".to_string()),
    };

    if bytes.is_empty() {
        return Err("payload is empty".to_string());
    }

    let mime_type = declared_mime.unwrap_or_else(|| sniff_mime(&bytes).to_string());
    Ok(NormalizedBinary {
        base64: STANDARD.encode(&bytes),
        mime_type,
        size_bytes: bytes.len(),
    })
}

fn decode_string(s: &str) -> Result<(Vec<u8>, Option<String>), String> {
    if let Some(rest) = s.strip_prefix("data:") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| "malformed data URL".to_string())?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| "only base64 data URLs are supported".to_string())?;
        let bytes = decode_base64(payload)?;
        let mime = if mime.is_empty() { None } else { Some(mime.to_string()) };
        return Ok((bytes, mime));
    }
    Ok((decode_base64(s)?, None))
}

fn decode_base64(s: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .or_else(|_| URL_SAFE.decode(&cleaned))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&cleaned))
        .map_err(|e| format!("invalid base64: {e}"))
}

fn bytes_from_array(items: &[Value]) -> Result<Vec<u8>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_u64()
                .filter(|n| *n <= u8::MAX as u64)
                .map(|n| n as u8)
                .ok_or_else(|| format!("element {i} is not a byte"))
        })
        .collect()
}

/// 根据魔数猜测 MIME 类型
fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB, ..] => "audio/mpeg",
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        [b'f', b'L', b'a', b'C', ..] => "audio/flac",
        [b'%', b'P', b'D', b'F', ..] => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FieldKind, ParamSchema};

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "vision.classify",
            ParamSchema::new()
                .required("image", FieldKind::Binary)
                .optional("mask", FieldKind::Binary),
        )
        .with_preprocessing()
    }

    #[test]
    fn test_byte_array_is_encoded() {
        let out = MediaPreprocessor::new()
            .preprocess(&descriptor(), json!({"image": [0x89, 80, 78, 71, 13, 10]}))
            .unwrap();
        assert_eq!(out["image"], STANDARD.encode([0x89u8, 80, 78, 71, 13, 10]));
        assert_eq!(out["imageMeta"]["mimeType"], "image/png");
        assert_eq!(out["imageMeta"]["sizeBytes"], 6);
        assert!(out.get("maskMeta").is_none());
    }

    #[test]
    fn test_data_url_keeps_declared_mime() {
        let normalized = normalize_binary(&json!("data:audio/wav;base64,aGVsbG8")).unwrap();
        assert_eq!(normalized.mime_type, "audio/wav");
        assert_eq!(normalized.base64, "aGVsbG8=");
        assert_eq!(normalized.size_bytes, 5);
    }

    #[test]
    fn test_url_safe_input_normalized_to_standard() {
        let raw = URL_SAFE_NO_PAD.encode([0xFBu8, 0xFF, 0xFE]);
        let normalized = normalize_binary(&json!(raw)).unwrap();
        assert_eq!(normalized.base64, STANDARD.encode([0xFBu8, 0xFF, 0xFE]));
    }

    #[test]
    fn test_invalid_payloads() {
        assert!(normalize_binary(&json!("!!not base64!!")).is_err());
        assert!(normalize_binary(&json!([1, 256])).is_err());
        assert!(normalize_binary(&json!("")).is_err());
        assert!(normalize_binary(&json!("data:text/plain,hello")).is_err());

        let err = MediaPreprocessor::new()
            .preprocess(&descriptor(), json!({"image": "%%%"}))
            .unwrap_err();
        assert!(err.to_string().starts_with("preprocessing failed: field 'image'"));
    }
}
