use super::Diagnostic;
use crate::bytecode::disasm::line_at;

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let severity = self.bold_red("error");
        match d.code {
            Some(code) => out.push_str(&format!("{severity}[{code}]: {}\n", self.bold(&d.message))),
            None => out.push_str(&format!("{severity}: {}\n", self.bold(&d.message))),
        }

        for label in &d.labels {
            out.push_str(&format!("  {} offset {}\n", self.cyan("-->"), label.offset));

            // The offending instruction, out of the disassembly.
            if let Some(text) = d.code_bytes.as_deref().and_then(|code| line_at(code, label.offset)) {
                let gutter = label.offset.to_string().len();
                let pipe = self.cyan("|");
                let pad = " ".repeat(gutter);

                out.push_str(&format!("{pad} {pipe}\n"));
                out.push_str(&format!("{} {pipe} {text}\n", self.cyan(&label.offset.to_string())));
                let carets = self.bold_red(&"^".repeat(text.len().max(1)));
                if label.message.is_empty() {
                    out.push_str(&format!("{pad} {pipe} {carets}\n"));
                } else {
                    out.push_str(&format!("{pad} {pipe} {carets} {}\n", self.bold_red(&label.message)));
                }
                out.push_str(&format!("{pad} {pipe}\n"));
            }
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{marshal, Instruction, Opcode};

    fn code() -> Vec<u8> {
        marshal(&[
            Instruction::new(Opcode::I32Const, &[10]),
            Instruction::new(Opcode::I32Const, &[0]),
            Instruction::new(Opcode::I32DivS, &[]),
        ])
    }

    fn make_diag() -> Diagnostic {
        Diagnostic::error("divide by zero")
            .with_code("VM0009")
            .with_offset(10, "here")
            .with_bytecode(&code())
            .with_note("in basic block 0")
            .with_suggestion("test the divisor first")
    }

    #[test]
    fn render_header_with_code() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.starts_with("error[VM0009]: divide by zero\n"), "bad header in:\n{out}");
    }

    #[test]
    fn render_shows_instruction_and_carets() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("--> offset 10"), "missing location in:\n{out}");
        assert!(out.contains("10 | i32.div_s"), "missing instruction in:\n{out}");
        assert!(out.contains("^^^^^^^^^ here"), "expected carets under i32.div_s in:\n{out}");
    }

    #[test]
    fn render_contains_note_and_suggestion() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("note: in basic block 0"));
        assert!(out.contains("suggestion: test the divisor first"));
    }

    #[test]
    fn render_without_bytecode_has_no_snippet() {
        let d = Diagnostic::error("stack underflow").with_offset(3, "here");
        let out = AnsiRenderer { use_color: false }.render(&d);
        assert!(out.contains("--> offset 3"));
        assert!(!out.contains('^'));
    }

    #[test]
    fn render_no_labels() {
        let out = AnsiRenderer { use_color: false }.render(&Diagnostic::error("something bad"));
        assert_eq!(out, "error: something bad\n");
    }

    #[test]
    fn color_toggle() {
        let d = make_diag();
        assert!(AnsiRenderer { use_color: true }.render(&d).contains("\x1b["));
        assert!(!AnsiRenderer { use_color: false }.render(&d).contains("\x1b["));
    }
}
