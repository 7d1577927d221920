use super::Diagnostic;
use crate::bytecode::disasm::line_at;

pub fn render(d: &Diagnostic) -> String {
    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            let mut obj = serde_json::json!({
                "offset": l.offset,
                "message": l.message,
            });
            if let Some(text) = d.code_bytes.as_deref().and_then(|code| line_at(code, l.offset)) {
                obj["instruction"] = serde_json::Value::from(text);
            }
            obj
        })
        .collect();

    let mut obj = serde_json::json!({
        "severity": "error",
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(code) = d.code {
        obj["code"] = serde_json::Value::String(code.to_string());
    }

    if let Some(s) = &d.suggestion {
        obj["suggestion"] = serde_json::Value::String(s.clone());
    }

    serde_json::to_string(&obj)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{marshal, Instruction, Opcode};
    use crate::error::{Error, ErrorKind};

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("type mismatch")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "type mismatch");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("suggestion").is_none());
        assert!(v.get("code").is_none());
    }

    #[test]
    fn render_from_error_with_bytecode() {
        let code = marshal(&[Instruction::new(Opcode::Nop, &[]), Instruction::new(Opcode::Drop, &[])]);
        let e = Error::new(ErrorKind::StackUnderflow).at(1).in_block(0);
        let d = Diagnostic::from(&e).with_bytecode(&code);
        let v = parse_json(&render(&d));
        assert_eq!(v["code"], "VM0005");
        let label = &v["labels"][0];
        assert_eq!(label["offset"], 1);
        assert_eq!(label["instruction"], "drop");
        assert_eq!(v["notes"][0], "in basic block 0");
    }

    #[test]
    fn label_without_bytecode_has_no_instruction() {
        let d = Diagnostic::error("bad").with_offset(5, "here");
        let v = parse_json(&render(&d));
        assert!(v["labels"][0].get("instruction").is_none());
    }
}
