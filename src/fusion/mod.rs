//! 多路输入融合
//!
//! 将同一 correlationId 下的多模态输入（图像、音频、传感器读数……）合并为一份统一输入，
//! 写入 `parameters.fused` 后再交给 Agent。每次调用无状态。

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::core::SupervisorError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FusionInput {
    #[serde(default)]
    modality: String,
    #[serde(default)]
    data: Value,
    weight: Option<f64>,
    timestamp: Option<i64>,
}

/// 融合器
#[derive(Debug, Default, Clone)]
pub struct FusionAggregator;

impl FusionAggregator {
    pub fn new() -> Self {
        Self
    }

    /// 读取 `parameters.inputs`，写入 `parameters.fused`；correlationId 缺省取 task_id
    pub fn fuse(&self, task_id: &str, mut params: Value) -> Result<Value, SupervisorError> {
        let obj = params
            .as_object_mut()
            .ok_or_else(|| SupervisorError::Fusion("parameters must be a JSON object".into()))?;

        let correlation_id = obj
            .get("correlationId")
            .and_then(Value::as_str)
            .unwrap_or(task_id)
            .to_string();

        let raw_inputs = obj
            .get("inputs")
            .cloned()
            .ok_or_else(|| SupervisorError::Fusion("missing 'inputs'".into()))?;
        let mut inputs: Vec<FusionInput> = serde_json::from_value(raw_inputs)
            .map_err(|e| SupervisorError::Fusion(format!("malformed inputs: {e}")))?;

        if inputs.is_empty() {
            return Err(SupervisorError::Fusion("no inputs to fuse".into()));
        }

        for (i, input) in inputs.iter().enumerate() {
            if input.modality.trim().is_empty() {
                return Err(SupervisorError::Fusion(format!("input {i} has no modality")));
            }
            if let Some(w) = input.weight {
                if !w.is_finite() || w <= 0.0 {
                    return Err(SupervisorError::Fusion(format!(
                        "input {i} has invalid weight {w}"
                    )));
                }
            }
        }

        // 按时间戳排序；无时间戳的排在最前并保持到达顺序（稳定排序）
        inputs.sort_by_key(|input| input.timestamp.unwrap_or(i64::MIN));

        let input_count = inputs.len();
        let mut by_modality: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut weight_sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_weight = 0.0;
        let timestamps: Vec<i64> = inputs.iter().filter_map(|i| i.timestamp).collect();

        for input in inputs {
            let weight = input.weight.unwrap_or(1.0);
            total_weight += weight;
            *weight_sums.entry(input.modality.clone()).or_default() += weight;
            by_modality.entry(input.modality).or_default().push(input.data);
        }

        let weights: Map<String, Value> = weight_sums
            .into_iter()
            .map(|(m, w)| (m, json!(w / total_weight)))
            .collect();
        let modalities: Vec<String> = by_modality.keys().cloned().collect();
        let time_span_ms = match (timestamps.iter().min(), timestamps.iter().max()) {
            (Some(min), Some(max)) => {
                let span = max.checked_sub(*min).ok_or_else(|| {
                    SupervisorError::Fusion(format!("timestamp range {min}..{max} is out of bounds"))
                })?;
                json!(span)
            }
            _ => Value::Null,
        };

        let fused = json!({
            "correlationId": correlation_id,
            "modalities": modalities,
            "inputCount": input_count,
            "byModality": by_modality,
            "weights": weights,
            "timeSpanMs": time_span_ms,
        });

        tracing::debug!(correlation_id = %correlation_id, inputs = input_count, "inputs fused");
        obj.insert("fused".to_string(), fused);
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_groups_by_modality() {
        let params = json!({
            "correlationId": "c-1",
            "inputs": [
                {"modality": "lidar", "data": {"d": 3.2}, "timestamp": 20, "weight": 2.0},
                {"modality": "camera", "data": "frame-1", "timestamp": 10},
                {"modality": "lidar", "data": {"d": 3.1}, "timestamp": 15, "weight": 1.0},
            ]
        });
        let out = FusionAggregator::new().fuse("t1", params).unwrap();
        let fused = &out["fused"];
        assert_eq!(fused["correlationId"], "c-1");
        assert_eq!(fused["modalities"], json!(["camera", "lidar"]));
        assert_eq!(fused["inputCount"], 3);
        assert_eq!(fused["byModality"]["lidar"], json!([{"d": 3.1}, {"d": 3.2}]));
        assert_eq!(fused["weights"]["lidar"], json!(0.75));
        assert_eq!(fused["timeSpanMs"], 10);
        // 原始输入保留
        assert!(out["inputs"].is_array());
    }

    #[test]
    fn test_correlation_defaults_to_task_id() {
        let out = FusionAggregator::new()
            .fuse("task-42", json!({"inputs": [{"modality": "text", "data": "hi"}]}))
            .unwrap();
        assert_eq!(out["fused"]["correlationId"], "task-42");
        assert!(out["fused"]["timeSpanMs"].is_null());
    }

    #[test]
    fn test_fusion_errors() {
        let fusion = FusionAggregator::new();
        for params in [
            json!({}),
            json!({"inputs": []}),
            json!({"inputs": [{"data": 1}]}),
            json!({"inputs": [{"modality": "a", "weight": 0.0}]}),
            json!({"inputs": "nope"}),
            json!({"inputs": [
                {"modality": "a", "timestamp": -9_000_000_000_000_000_000i64},
                {"modality": "b", "timestamp": 9_000_000_000_000_000_000i64},
            ]}),
        ] {
            let err = fusion.fuse("t", params).unwrap_err();
            assert!(matches!(err, SupervisorError::Fusion(_)), "{err}");
        }
    }
}
