//! Kernel signature extraction from device source

use std::fmt;

use ezcu_driver::ScalarValue;

use crate::error::{EzcuError, Result};
use crate::flags::{ElementType, FlagValue};

const GLOBAL: &str = "__global__";
const VOID: &str = "void";

/// Type tag of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    /// Device pointer, bound to a wrapped memory object
    Pointer,
    Scalar(ElementType),
}

impl ArgType {
    /// Type tag a scalar value satisfies.
    pub fn of_scalar(value: &ScalarValue) -> Self {
        let element = match value {
            ScalarValue::Char(_) => ElementType::Char,
            ScalarValue::Short(_) => ElementType::Short,
            ScalarValue::Int(_) => ElementType::Int,
            ScalarValue::UnsignedInt(_) => ElementType::UnsignedInt,
            ScalarValue::Long(_) => ElementType::Long,
            ScalarValue::UnsignedLong(_) => ElementType::UnsignedLong,
            ScalarValue::SizeT(_) => ElementType::SizeT,
            ScalarValue::Float(_) => ElementType::Float,
            ScalarValue::Double(_) => ElementType::Double,
        };
        ArgType::Scalar(element)
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Pointer => f.write_str("POINTER"),
            ArgType::Scalar(element) => f.write_str(element.name()),
        }
    }
}

/// Name and parameter types of one `__global__` function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<ArgType>,
}

/// Extract every `__global__ void name(...)` declaration from `source`, in order.
pub fn parse_kernels(source: &str) -> Result<Vec<KernelSignature>> {
    let mut kernels = Vec::new();
    let mut rest = source;

    while let Some(start) = rest.find(GLOBAL) {
        let after_global = &rest[start + GLOBAL.len()..];
        let Some(void_at) = after_global.find(VOID) else {
            break;
        };
        let declaration = &after_global[void_at + VOID.len()..];
        let open = declaration.find('(').ok_or_else(|| signature_error("?", "missing '('"))?;
        let name = declaration[..open].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(signature_error(name, "invalid kernel name"));
        }
        let close = declaration[open..]
            .find(')')
            .map(|at| open + at)
            .ok_or_else(|| signature_error(name, "missing ')'"))?;

        let params = parse_params(name, &declaration[open + 1..close])?;
        kernels.push(KernelSignature {
            name: name.to_string(),
            params,
        });

        rest = skip_body(&declaration[close + 1..]);
    }
    Ok(kernels)
}

/// Text after the body that opens in `text`, or after the `;` of a prototype.
fn skip_body(text: &str) -> &str {
    let mut depth = 0usize;
    for (at, c) in text.char_indices() {
        match c {
            ';' if depth == 0 => return &text[at + 1..],
            '{' => depth += 1,
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return &text[at + 1..];
                }
            }
            _ => {}
        }
    }
    ""
}

fn parse_params(kernel: &str, list: &str) -> Result<Vec<ArgType>> {
    let list = list.trim();
    if list.is_empty() || list == VOID {
        return Ok(Vec::new());
    }
    list.split(',').map(|param| parse_param(kernel, param.trim())).collect()
}

fn parse_param(kernel: &str, param: &str) -> Result<ArgType> {
    if param.contains('*') {
        return Ok(ArgType::Pointer);
    }
    let mut words: Vec<&str> = param.split_whitespace().collect();
    // drop the parameter name
    if words.len() > 1 {
        words.pop();
    }
    let has = |word: &str| words.contains(&word);

    let element = if has("unsigned") || words.iter().any(|w| w.starts_with("uint")) {
        if has("long") || has("uint64_t") {
            ElementType::UnsignedLong
        } else {
            ElementType::UnsignedInt
        }
    } else if has("size_t") {
        ElementType::SizeT
    } else if has("float") {
        ElementType::Float
    } else if has("double") {
        ElementType::Double
    } else if has("long") || has("int64_t") {
        ElementType::Long
    } else if has("short") || has("int16_t") {
        ElementType::Short
    } else if has("int") || has("int32_t") {
        ElementType::Int
    } else if has("char") || has("int8_t") {
        ElementType::Char
    } else {
        return Err(signature_error(kernel, format!("unsupported parameter type '{param}'")));
    };
    Ok(ArgType::Scalar(element))
}

fn signature_error(kernel: &str, reason: impl Into<String>) -> EzcuError {
    EzcuError::Signature {
        kernel: kernel.to_string(),
        reason: reason.into(),
    }
}
