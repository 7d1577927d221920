/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    /// One-line description for listings.
    pub short: &'static str,
    /// Full explanation for `nbvm explain`.
    pub long: &'static str,
}

/// Every stable error code the verifier and interpreter can raise.
pub static REGISTRY: &[ErrorEntry] = &[
    ErrorEntry {
        code: "VM0001",
        short: "unknown opcode",
        long: r#"## VM0001: unknown opcode

The byte at the reported offset is not an assigned opcode. Opcodes live in
sparse groups (control 0x00-0x15, i32 0x20-0x3E, i64 0x40-0x5D, f32
0x60-0x6F, f64 0x70-0x7F, strings 0x80-0x83, arrays 0x90-0x94, structs
0xA0-0xA3); anything between the groups is unassigned.

This usually means the bytecode was truncated or a branch landed in the
middle of an operand.
"#,
    },
    ErrorEntry {
        code: "VM0002",
        short: "unreachable executed",
        long: r#"## VM0002: unreachable executed

An `unreachable` instruction ran. Code generators emit it after calls that
never return and in switch arms that cannot be taken; reaching it means that
assumption was wrong.
"#,
    },
    ErrorEntry {
        code: "VM0003",
        short: "segmentation fault",
        long: r#"## VM0003: segmentation fault

An index or reference pointed outside what it indexes:

- `local.*` beyond the function's parameters and locals
- `global.get` of a global no path has written yet
- `const.get`, a type index or a struct field index out of range
- an array index outside `[0, len)`, or a negative default length
- a null or freed reference dereferenced by `call`, `string.*`, `array.*`
  or `struct.*`
"#,
    },
    ErrorEntry {
        code: "VM0004",
        short: "stack overflow",
        long: r#"## VM0004: stack overflow

A push would exceed the operand stack size (1024 slots by default, locals
included). The verifier reports this statically when a loop grows the stack
on every iteration.

**Example:**

    0: i32.const 1
    5: br -10
"#,
    },
    ErrorEntry {
        code: "VM0005",
        short: "stack underflow",
        long: r#"## VM0005: stack underflow

An instruction popped more operands than the current frame has above its
locals. A frame can never pop into its own locals or its caller's values.

**Example:**

    0: i32.const 1
    5: i32.add
"#,
    },
    ErrorEntry {
        code: "VM0006",
        short: "frame overflow",
        long: r#"## VM0006: frame overflow

A call would exceed the maximum call depth (128 frames by default). This is
almost always unbounded recursion.
"#,
    },
    ErrorEntry {
        code: "VM0007",
        short: "frame underflow",
        long: r#"## VM0007: frame underflow

The interpreter tried to return with no active frame. This indicates a bug
in a host embedding, not in the bytecode.
"#,
    },
    ErrorEntry {
        code: "VM0008",
        short: "type mismatch",
        long: r#"## VM0008: type mismatch

An operand had the wrong kind or type for the instruction consuming it: an
`f32` fed to `i32.add`, a string passed where a function signature expects
an `i32`, a value of the wrong type stored into an array or struct field,
or a native function returning the wrong number of values.

**Example:**

    0: f32.const 1.5
    5: i32.const 1
    10: i32.add
"#,
    },
    ErrorEntry {
        code: "VM0009",
        short: "divide by zero",
        long: r#"## VM0009: divide by zero

An integer `div_s`, `div_u`, `rem_s` or `rem_u` had a zero divisor. Float
division by zero is not an error; it yields an infinity or NaN.
"#,
    },
    ErrorEntry {
        code: "VM0010",
        short: "invalid jump",
        long: r#"## VM0010: invalid jump

A branch target lies outside the code or in the middle of an instruction.
Displacements are relative to the offset of the instruction following the
branch, so `br 0` continues with the next instruction.
"#,
    },
    ErrorEntry {
        code: "VM0011",
        short: "native function failed",
        long: r#"## VM0011: native function failed

A host function called from bytecode reported an error. The message comes
from the host; the offset is that of the `call` instruction.
"#,
    },
];

/// Look up an error entry by code (e.g. `"VM0005"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn lookup_known_code() {
        let e = lookup("VM0005").expect("VM0005 should be in registry");
        assert_eq!(e.short, "stack underflow");
        assert!(e.long.contains("VM0005"));
        assert!(lookup("vm0008").is_some());
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("VM9999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let len_before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len_before, "duplicate codes in registry");
    }

    #[test]
    fn every_error_kind_is_registered() {
        let kinds = [
            ErrorKind::UnknownOpcode,
            ErrorKind::UnreachableExecuted,
            ErrorKind::SegmentationFault,
            ErrorKind::StackOverflow,
            ErrorKind::StackUnderflow,
            ErrorKind::FrameOverflow,
            ErrorKind::FrameUnderflow,
            ErrorKind::TypeMismatch,
            ErrorKind::DivideByZero,
            ErrorKind::InvalidJump,
            ErrorKind::Native(String::new()),
        ];
        for kind in kinds {
            let entry = lookup(kind.code()).unwrap_or_else(|| panic!("{} missing", kind.code()));
            assert!(kind.to_string().starts_with(entry.short), "{} short text drifted", entry.code);
        }
    }
}
