//! FFI Type System
//!
//! Caller-declared descriptors for foreign signatures. Shared libraries carry
//! no signature metadata, so these are assertions about the binary, never
//! facts read from it.

use std::fmt;
use std::str::FromStr;

use super::error::{ParseValueError, SignatureError};

/// Declared type of a parameter or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiType {
    /// Void (no value)
    Void,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Opaque pointer
    Ptr,
    /// Null-terminated C string (const char*)
    CStr,
    /// Byte buffer, lowered to a (const uint8_t*, size_t) pair
    Buffer,
}

impl FfiType {
    /// Size in bytes when passed by value
    pub fn size(&self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::U8 | FfiType::I8 => 1,
            FfiType::U16 | FfiType::I16 => 2,
            FfiType::U32 | FfiType::I32 | FfiType::F32 => 4,
            FfiType::U64 | FfiType::I64 | FfiType::F64 => 8,
            FfiType::Ptr | FfiType::CStr => std::mem::size_of::<usize>(),
            FfiType::Buffer => std::mem::size_of::<usize>() * 2, // ptr + len
        }
    }

    /// Check if this type is an integer type
    pub fn is_integer(&self) -> bool {
        self.int_range().is_some()
    }

    /// Check if this type is a signed integer type
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            FfiType::I8 | FfiType::I16 | FfiType::I32 | FfiType::I64
        )
    }

    /// Check if this type is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, FfiType::F32 | FfiType::F64)
    }

    /// Check if this type is a pointer type
    pub fn is_pointer(&self) -> bool {
        matches!(self, FfiType::Ptr | FfiType::CStr | FfiType::Buffer)
    }

    /// Inclusive value range of an integer type.
    pub fn int_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            FfiType::U8 => (0, u8::MAX as i128),
            FfiType::U16 => (0, u16::MAX as i128),
            FfiType::U32 => (0, u32::MAX as i128),
            FfiType::U64 => (0, u64::MAX as i128),
            FfiType::I8 => (i8::MIN as i128, i8::MAX as i128),
            FfiType::I16 => (i16::MIN as i128, i16::MAX as i128),
            FfiType::I32 => (i32::MIN as i128, i32::MAX as i128),
            FfiType::I64 => (i64::MIN as i128, i64::MAX as i128),
            _ => return None,
        };
        Some(range)
    }
}

impl FromStr for FfiType {
    type Err = SignatureError;

    /// Accepts the short names used in `Display` as well as common C spellings.
    /// Sizes follow the LP64 data model (`long` is 64 bits).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_c_type(s);
        let ty = match normalized.to_lowercase().as_str() {
            "void" => FfiType::Void,
            "u8" | "uint8" | "uint8_t" | "byte" | "unsigned char" => FfiType::U8,
            "u16" | "uint16" | "uint16_t" | "unsigned short" => FfiType::U16,
            "u32" | "uint32" | "uint32_t" | "unsigned" | "unsigned int" => FfiType::U32,
            "u64" | "uint64" | "uint64_t" | "ulong" | "unsigned long" | "unsigned long long"
            | "size_t" | "usize" => FfiType::U64,
            "i8" | "int8" | "int8_t" | "char" | "signed char" => FfiType::I8,
            "i16" | "int16" | "int16_t" | "short" => FfiType::I16,
            "i32" | "int32" | "int32_t" | "int" => FfiType::I32,
            "i64" | "int64" | "int64_t" | "long" | "long long" | "ssize_t" | "isize" => {
                FfiType::I64
            }
            "f32" | "float" => FfiType::F32,
            "f64" | "double" => FfiType::F64,
            "ptr" | "pointer" | "void*" => FfiType::Ptr,
            "cstr" | "string" | "char*" | "const char*" => FfiType::CStr,
            "buffer" | "bytes" => FfiType::Buffer,
            other if other.ends_with('*') => FfiType::Ptr,
            _ => return Err(SignatureError::UnknownType(s.trim().to_string())),
        };
        Ok(ty)
    }
}

impl fmt::Display for FfiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FfiType::Void => "void",
            FfiType::U8 => "u8",
            FfiType::U16 => "u16",
            FfiType::U32 => "u32",
            FfiType::U64 => "u64",
            FfiType::I8 => "i8",
            FfiType::I16 => "i16",
            FfiType::I32 => "i32",
            FfiType::I64 => "i64",
            FfiType::F32 => "f32",
            FfiType::F64 => "f64",
            FfiType::Ptr => "ptr",
            FfiType::CStr => "cstr",
            FfiType::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

/// Collapse whitespace and attach `*` to the type it modifies, so that
/// `char *s`, `char* s` and `char * s` all read as `char* s`.
fn normalize_c_type(s: &str) -> String {
    let joined = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let attached = joined.replace(" *", "*").replace('*', "* ");
    attached
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// An argument or return value crossing the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum FfiValue {
    /// No value; also the completion marker of a void call
    Void,
    /// Unsigned integer (any width up to 64 bits)
    Integer(u64),
    /// Signed integer (any width up to 64 bits)
    Signed(i64),
    /// Floating point (f32 values are widened)
    Float(f64),
    /// Raw pointer value
    Pointer(usize),
    /// Owned string, passed as a NUL-terminated copy
    String(String),
    /// Owned buffer, passed as a pointer and length pair
    Buffer(Vec<u8>),
}

impl FfiValue {
    /// Read a textual argument as a value of the declared type.
    ///
    /// Integers accept decimal or `0x` hex; pointers additionally accept
    /// `null`. Strings and buffers take the text as-is.
    pub fn parse_as(ty: FfiType, text: &str) -> Result<Self, ParseValueError> {
        let fail = |reason: &str| ParseValueError {
            text: text.to_string(),
            ty,
            reason: reason.to_string(),
        };

        let value = match ty {
            FfiType::Void => return Err(fail("void parameters take no value")),
            _ if ty.is_integer() => {
                let wide = parse_int(text).ok_or_else(|| fail("not an integer"))?;
                let (min, max) = ty.int_range().unwrap_or((0, 0));
                if wide < min || wide > max {
                    return Err(fail("out of range"));
                }
                if ty.is_signed() {
                    FfiValue::Signed(wide as i64)
                } else {
                    FfiValue::Integer(wide as u64)
                }
            }
            FfiType::F32 | FfiType::F64 => FfiValue::Float(
                text.trim()
                    .parse::<f64>()
                    .map_err(|_| fail("not a number"))?,
            ),
            FfiType::Ptr => {
                if text.trim().eq_ignore_ascii_case("null") {
                    FfiValue::Pointer(0)
                } else {
                    let wide = parse_int(text).ok_or_else(|| fail("not an address"))?;
                    let addr = usize::try_from(wide).map_err(|_| fail("not an address"))?;
                    FfiValue::Pointer(addr)
                }
            }
            FfiType::CStr => FfiValue::String(text.to_string()),
            FfiType::Buffer => FfiValue::Buffer(text.as_bytes().to_vec()),
            _ => return Err(fail("unsupported type")),
        };
        Ok(value)
    }

    /// Get the type of this value
    pub fn get_type(&self) -> FfiType {
        match self {
            FfiValue::Void => FfiType::Void,
            FfiValue::Integer(_) => FfiType::U64,
            FfiValue::Signed(_) => FfiType::I64,
            FfiValue::Float(_) => FfiType::F64,
            FfiValue::Pointer(_) => FfiType::Ptr,
            FfiValue::String(_) => FfiType::CStr,
            FfiValue::Buffer(_) => FfiType::Buffer,
        }
    }

    /// Check if this is a void value
    pub fn is_void(&self) -> bool {
        matches!(self, FfiValue::Void)
    }

    /// Integer payload widened to i128, for range checks.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            FfiValue::Integer(v) => Some(*v as i128),
            FfiValue::Signed(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FfiValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<usize> {
        match self {
            FfiValue::Pointer(p) => Some(*p),
            _ => None,
        }
    }
}

impl fmt::Display for FfiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiValue::Void => write!(f, "()"),
            FfiValue::Integer(v) => write!(f, "{}", v),
            FfiValue::Signed(v) => write!(f, "{}", v),
            FfiValue::Float(v) => write!(f, "{}", v),
            FfiValue::Pointer(p) => write!(f, "{:#x}", p),
            FfiValue::String(s) => write!(f, "{:?}", s),
            FfiValue::Buffer(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

fn parse_int(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, body) = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    // from_str_radix takes its own sign; only one is allowed
    if body.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from_str_radix(body, radix).ok()?;
    if negative {
        magnitude.checked_neg()
    } else {
        Some(magnitude)
    }
}

/// Caller-declared C signature of an exported symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiSignature {
    /// Function name
    pub name: String,
    /// Parameter types
    pub params: Vec<FfiType>,
    /// Return type
    pub return_type: FfiType,
    /// Whether this function is variadic
    pub variadic: bool,
}

impl FfiSignature {
    /// Create a new function signature
    pub fn new(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            variadic: false,
        }
    }

    /// Create a variadic function signature
    pub fn variadic(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            variadic: true,
        }
    }

    /// Whether `arg_count` arguments satisfy the parameter list
    pub fn validate_args(&self, arg_count: usize) -> bool {
        if self.variadic {
            arg_count >= self.params.len()
        } else {
            arg_count == self.params.len()
        }
    }

    /// Reject shapes that have no C representation.
    pub fn check(&self) -> Result<(), SignatureError> {
        if !is_identifier(&self.name) {
            return Err(SignatureError::InvalidName(self.name.clone()));
        }
        if let Some(&ty) = self.params.iter().find(|t| **t == FfiType::Void) {
            return Err(SignatureError::InvalidParam(ty));
        }
        if self.return_type == FfiType::Buffer {
            return Err(SignatureError::InvalidReturn(self.return_type));
        }
        Ok(())
    }

    /// Parse from a C-style signature string
    /// Format: "return_type function_name(param1_type [name], param2_type [name], ...)"
    pub fn parse(signature: &str) -> Result<Self, SignatureError> {
        let signature = signature.trim();

        let paren_pos = signature
            .find('(')
            .ok_or_else(|| SignatureError::MissingParens(signature.to_string()))?;
        let inner = signature[paren_pos + 1..]
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(|| SignatureError::MissingParens(signature.to_string()))?;

        // Split return type and name
        let head = normalize_c_type(&signature[..paren_pos]);
        let (return_text, name) = head
            .rsplit_once(' ')
            .ok_or_else(|| SignatureError::MissingName(signature.to_string()))?;
        let return_type = return_text.parse::<FfiType>()?;

        let mut params = Vec::new();
        let mut variadic = false;
        let pieces: Vec<&str> = inner.split(',').map(str::trim).collect();
        let is_empty_list = inner.trim().is_empty()
            || (pieces.len() == 1 && pieces[0].eq_ignore_ascii_case("void"));

        if !is_empty_list {
            for (i, piece) in pieces.iter().enumerate() {
                if piece.is_empty() {
                    return Err(SignatureError::EmptyParam(signature.to_string()));
                }
                if *piece == "..." {
                    if i + 1 != pieces.len() {
                        return Err(SignatureError::MisplacedVariadic(signature.to_string()));
                    }
                    variadic = true;
                    continue;
                }
                params.push(parse_param(piece)?);
            }
        }

        let parsed = Self {
            name: name.to_string(),
            params,
            return_type,
            variadic,
        };
        parsed.check()?;
        Ok(parsed)
    }
}

/// A parameter is a type, optionally followed by a parameter name.
fn parse_param(text: &str) -> Result<FfiType, SignatureError> {
    let normalized = normalize_c_type(text);
    if let Ok(ty) = normalized.parse::<FfiType>() {
        return Ok(ty);
    }
    match normalized.rsplit_once(' ') {
        Some((ty_text, name)) if is_identifier(name) => ty_text.parse(),
        _ => Err(SignatureError::UnknownType(text.to_string())),
    }
}

impl FromStr for FfiSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FfiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}
