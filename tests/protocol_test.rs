use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::{json, Value};

use sam_seg_rs::config::{Backend, Precision};
use sam_seg_rs::{
    Config, ImageSource, OutboundMessage, Prompt, Request, RequestEnvelope, SamSegError,
    SegmentPhase,
};

fn parse(line: &str) -> sam_seg_rs::Result<Request> {
    Request::try_from(RequestEnvelope::from_json_line(line)?)
}

#[test]
fn test_host_request_lines() {
    assert_eq!(parse(r#"{"type":"reset","data":null}"#).unwrap(), Request::Reset);
    assert_eq!(
        parse(r#"{"type":"segment","data":{"path":"images/dog.jpg"}}"#).unwrap(),
        Request::Segment(ImageSource::Path(PathBuf::from("images/dog.jpg")))
    );
    assert_eq!(
        parse(r#"{"type":"decode","data":[{"point":[0.25,0.75],"label":1}]}"#).unwrap(),
        Request::Decode(vec![Prompt::foreground(0.25, 0.75)])
    );
}

#[test]
fn test_prompt_order_survives_parsing() {
    let request = parse(
        r#"{"type":"decode","data":[
            {"point":[0.1,0.1],"label":1},
            {"point":[0.2,0.2],"label":0},
            {"point":[0.3,0.3],"label":1}
        ]}"#,
    )
    .unwrap();

    match request {
        Request::Decode(prompts) => {
            let xs: Vec<f32> = prompts.iter().map(|p| p.point[0]).collect();
            let labels: Vec<i64> = prompts.iter().map(|p| p.label).collect();
            assert_eq!(xs, vec![0.1, 0.2, 0.3]);
            assert_eq!(labels, vec![1, 0, 1]);
        }
        other => panic!("Expected decode, got {:?}", other),
    }
}

#[test]
fn test_rejected_lines() {
    assert!(matches!(
        parse("not json"),
        Err(SamSegError::InvalidRequest { .. })
    ));
    assert!(matches!(
        parse(r#"{"data":[]}"#),
        Err(SamSegError::InvalidRequest { .. })
    ));
    assert!(matches!(
        parse(r#"{"type":"embed","data":{}}"#),
        Err(SamSegError::UnknownRequest { kind }) if kind == "embed"
    ));
    assert!(matches!(
        parse(r#"{"type":"segment","data":42}"#),
        Err(SamSegError::InvalidRequest { kind, .. }) if kind == "segment"
    ));
}

#[test]
fn test_outbound_lines() {
    let lines = [
        OutboundMessage::Ready.to_json_line().unwrap(),
        OutboundMessage::SegmentResult(SegmentPhase::Start)
            .to_json_line()
            .unwrap(),
        OutboundMessage::SegmentResult(SegmentPhase::Done)
            .to_json_line()
            .unwrap(),
        OutboundMessage::DecodeResult {
            mask: Path::new("output/mask-3.png"),
            scores: &[0.75, 0.5, 0.25],
        }
        .to_json_line()
        .unwrap(),
        OutboundMessage::Error {
            request: "bogus",
            message: "Unknown message type: bogus",
        }
        .to_json_line()
        .unwrap(),
    ];

    let values: Vec<Value> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(values[0], json!({ "type": "ready" }));
    assert_eq!(values[1], json!({ "type": "segment_result", "data": "start" }));
    assert_eq!(values[2], json!({ "type": "segment_result", "data": "done" }));
    assert_eq!(
        values[3],
        json!({
            "type": "decode_result",
            "data": { "mask": "output/mask-3.png", "scores": [0.75, 0.5, 0.25] }
        })
    );
    assert_eq!(
        values[4],
        json!({
            "type": "error",
            "data": { "request": "bogus", "message": "Unknown message type: bogus" }
        })
    );
}

#[test]
fn test_command_line_config() {
    let config = Config::try_parse_from([
        "sam-seg-rs",
        "--model-root",
        "/models",
        "--precision",
        "quantized",
        "--backend",
        "cpu",
        "--cache-capacity",
        "8",
        "--request-timeout-secs",
        "30",
        "--format",
        "webp",
    ])
    .unwrap();

    assert_eq!(config.precision, Precision::Quantized);
    assert_eq!(config.backend, Backend::Cpu);
    assert_eq!(config.cache_capacity.map(|c| c.get()), Some(8));
    assert_eq!(config.inbox_capacity, 1);
    assert_eq!(
        config.encoder_path(),
        PathBuf::from("/models/Xenova/slimsam-77-uniform/onnx/vision_encoder_quantized.onnx")
    );
    assert_eq!(
        config.decoder_path(),
        PathBuf::from(
            "/models/Xenova/slimsam-77-uniform/onnx/prompt_encoder_mask_decoder_quantized.onnx"
        )
    );

    assert!(Config::try_parse_from(["sam-seg-rs", "--format", "txt"]).is_err());
    assert!(Config::try_parse_from(["sam-seg-rs", "--inbox-capacity", "0"]).is_err());
}
