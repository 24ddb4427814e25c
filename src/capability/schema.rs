//! 参数结构校验
//!
//! 每个 taskType 声明一组字段（名称、类型、是否必填）；准入时校验 parameters，
//! 通过后下游可以假定字段存在且类型正确。

use serde_json::Value;

use crate::core::SupervisorError;

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    /// 二进制载荷：base64 字符串、data URL 或字节数组，由 MediaPreprocessor 归一化
    Binary,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Binary => value.is_string() || value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Bool => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Binary => "binary",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// 某个 taskType 的参数 schema
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    fields: Vec<FieldSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// 二进制字段名（预处理阶段需要归一化）
    pub fn binary_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Binary)
            .map(|f| f.name.as_str())
    }

    /// 校验 parameters；一次性报告所有问题
    pub fn validate(&self, params: &Value) -> Result<(), SupervisorError> {
        let obj = params.as_object().ok_or_else(|| {
            SupervisorError::InvalidRequest("parameters must be a JSON object".to_string())
        })?;

        let mut problems = Vec::new();
        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("missing required field '{}'", field.name));
                    }
                }
                Some(value) if !field.kind.matches(value) => {
                    problems.push(format!(
                        "field '{}' must be {}",
                        field.name,
                        field.kind.name()
                    ));
                }
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::InvalidRequest(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .required("image", FieldKind::Binary)
            .optional("topK", FieldKind::Integer)
    }

    #[test]
    fn test_valid_parameters() {
        assert!(schema().validate(&json!({"image": "aGVsbG8=", "topK": 3})).is_ok());
        assert!(schema().validate(&json!({"image": [1, 2, 3]})).is_ok());
    }

    #[test]
    fn test_reports_every_problem() {
        let err = schema().validate(&json!({"topK": 1.5})).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing required field 'image'"));
        assert!(msg.contains("field 'topK' must be integer"));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = schema().validate(&json!("just a string")).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidRequest(_)));
    }

    #[test]
    fn test_null_optional_is_ignored() {
        assert!(schema().validate(&json!({"image": "aGk=", "topK": null})).is_ok());
    }
}
