//! Symbol binding and invocation
//!
//! Arguments are lowered into two register lanes: an integer lane (integers,
//! pointers, C strings, buffer pointer and length) and a floating-point lane.
//! On the System V x86-64 and AArch64 C ABIs the two register files are
//! assigned independently, so a call through
//! `extern "C" fn(u64 x N, f64 x M) -> R` places every argument in the
//! register the callee expects, whatever the interleaving of the declared
//! prototype. `f32` arguments travel in the low 32 bits of a double register.
//!
//! Other targets assign argument slots positionally; there only signatures
//! without floating-point values are accepted.
//!
//! Nothing here can detect a declared signature that disagrees with the
//! binary, or a fault raised inside foreign code. Both are fatal to the
//! whole process.

use std::ffi::CString;

use super::error::{BindError, InvokeError};
use super::loader::LibraryHandle;
use super::types::{FfiSignature, FfiType, FfiValue};

/// Integer registers the dispatch table can fill
pub const MAX_INT_LANES: usize = 6;
/// Floating-point registers the dispatch table can fill
pub const MAX_FLOAT_LANES: usize = 4;

const LANE_SPLIT_ABI: bool = cfg!(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64")
));

// Apple's AArch64 ABI passes variadic arguments on the stack.
const VARIADIC_EXTRAS: bool = cfg!(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(all(target_vendor = "apple", target_arch = "aarch64"))
));

/// Outcome of one foreign call. `FfiValue::Void` marks a completed void call.
pub type InvocationResult = Result<FfiValue, InvokeError>;

/// An exported symbol bound to a caller-declared signature.
///
/// Borrows its [`LibraryHandle`], so the handle outlives every invocation
/// made through the binding.
#[derive(Debug)]
pub struct SymbolBinding<'lib> {
    handle: &'lib LibraryHandle,
    signature: FfiSignature,
    address: usize,
}

impl LibraryHandle {
    /// Bind an exported symbol to a declared signature.
    ///
    /// Fails with [`BindError::SymbolNotFound`] when the exact name is not
    /// exported, and with [`BindError::UnsupportedSignature`] when the shape
    /// cannot be marshalled on this target.
    ///
    /// # Safety
    ///
    /// `signature` must match what the binary actually implements: argument
    /// types in order, return type, and the C calling convention. The image
    /// carries no signature metadata, so nothing checks this. A mismatch is
    /// undefined behavior on every later [`SymbolBinding::invoke`].
    pub unsafe fn bind(&self, signature: &FfiSignature) -> Result<SymbolBinding<'_>, BindError> {
        signature.check()?;
        check_target_support(signature)?;

        let address = self.resolve(&signature.name)?;
        tracing::debug!(signature = %signature, handle = %self.id(), "bound symbol");

        Ok(SymbolBinding {
            handle: self,
            signature: signature.clone(),
            address,
        })
    }

    /// Parse a C-style declaration such as `"i32 double_me(i32)"` and bind it.
    ///
    /// # Safety
    ///
    /// Same contract as [`bind`](Self::bind).
    pub unsafe fn bind_decl(&self, declaration: &str) -> Result<SymbolBinding<'_>, BindError> {
        let signature = FfiSignature::parse(declaration)?;
        self.bind(&signature)
    }
}

impl<'lib> SymbolBinding<'lib> {
    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn signature(&self) -> &FfiSignature {
        &self.signature
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn handle(&self) -> &'lib LibraryHandle {
        self.handle
    }

    /// Call the foreign function synchronously on the current thread.
    ///
    /// Argument count, types, integer ranges and C strings are validated
    /// before control leaves the bridge. There is no timeout: a call that
    /// never returns blocks this thread forever. A fault inside the callee is
    /// not reported; it terminates the process. Calls are not retried.
    pub fn invoke(&self, args: &[FfiValue]) -> InvocationResult {
        if !self.signature.validate_args(args.len()) {
            return Err(InvokeError::ArgCount {
                function: self.signature.name.clone(),
                expected: self.signature.params.len(),
                got: args.len(),
            });
        }

        let lanes = marshal(&self.signature, args)?;
        let _serialized = self.handle.call_lock();
        tracing::trace!(
            function = %self.signature.name,
            ints = lanes.ints.len(),
            floats = lanes.floats.len(),
            "invoking foreign function"
        );

        // Safety: `bind` obliged the caller to declare the binary's true
        // signature, and the lanes were built from that declaration.
        let result = unsafe { dispatch(self.address, self.signature.return_type, &lanes) };

        result.ok_or_else(|| InvokeError::TooManyArgs {
            function: self.signature.name.clone(),
            ints: lanes.ints.len(),
            floats: lanes.floats.len(),
            max_ints: MAX_INT_LANES,
            max_floats: MAX_FLOAT_LANES,
        })
    }
}

fn check_target_support(signature: &FfiSignature) -> Result<(), BindError> {
    let unsupported = |reason: String| BindError::UnsupportedSignature {
        signature: signature.to_string(),
        reason,
    };

    let (ints, floats) = lane_demand(&signature.params);
    if ints > MAX_INT_LANES || floats > MAX_FLOAT_LANES {
        return Err(unsupported(format!(
            "needs {} integer and {} float registers, limit is {} and {}",
            ints, floats, MAX_INT_LANES, MAX_FLOAT_LANES
        )));
    }
    if !LANE_SPLIT_ABI && (floats > 0 || signature.return_type.is_float()) {
        return Err(unsupported(
            "floating-point values are only supported on System V x86-64 and AArch64".to_string(),
        ));
    }
    Ok(())
}

/// Registers needed by the declared parameters: (integer, float).
pub(crate) fn lane_demand(params: &[FfiType]) -> (usize, usize) {
    params.iter().fold((0, 0), |(ints, floats), ty| match ty {
        FfiType::F32 | FfiType::F64 => (ints, floats + 1),
        FfiType::Buffer => (ints + 2, floats),
        FfiType::Void => (ints, floats),
        _ => (ints + 1, floats),
    })
}

/// Arguments lowered to registers.
#[derive(Debug, Default)]
pub(crate) struct Lanes {
    pub(crate) ints: Vec<u64>,
    pub(crate) floats: Vec<f64>,
    /// NUL-terminated copies that must outlive the call
    #[allow(dead_code)]
    strings: Vec<CString>,
}

impl Lanes {
    fn push_cstr(&mut self, s: &str, function: &str, index: usize) -> Result<(), InvokeError> {
        let owned = CString::new(s).map_err(|_| InvokeError::InvalidString {
            function: function.to_string(),
            index,
        })?;
        // The heap buffer does not move when the CString moves into the Vec
        self.ints.push(owned.as_ptr() as u64);
        self.strings.push(owned);
        Ok(())
    }
}

/// Lower `args` into register lanes according to the declared signature.
pub(crate) fn marshal(sig: &FfiSignature, args: &[FfiValue]) -> Result<Lanes, InvokeError> {
    let mut lanes = Lanes::default();
    let function = sig.name.as_str();

    for (index, arg) in args.iter().enumerate() {
        let wrong_type = |expected: FfiType| InvokeError::ArgType {
            function: function.to_string(),
            index,
            expected,
            got: arg.get_type(),
        };

        let Some(&declared) = sig.params.get(index) else {
            if !sig.variadic {
                return Err(InvokeError::ArgCount {
                    function: function.to_string(),
                    expected: sig.params.len(),
                    got: args.len(),
                });
            }
            marshal_variadic(&mut lanes, function, index, arg)?;
            continue;
        };

        match declared {
            ty if ty.is_integer() => {
                let value = arg.as_i128().ok_or_else(|| wrong_type(ty))?;
                let (min, max) = ty.int_range().unwrap_or((0, 0));
                if value < min || value > max {
                    return Err(InvokeError::OutOfRange {
                        function: function.to_string(),
                        index,
                        value,
                        ty,
                    });
                }
                let raw = if ty.is_signed() {
                    value as i64 as u64
                } else {
                    value as u64
                };
                lanes.ints.push(raw);
            }
            FfiType::F64 => {
                let value = arg.as_f64().ok_or_else(|| wrong_type(declared))?;
                lanes.floats.push(value);
            }
            FfiType::F32 => {
                let value = arg.as_f64().ok_or_else(|| wrong_type(declared))?;
                lanes.floats.push(pack_f32(value as f32));
            }
            FfiType::Ptr => {
                let value = arg.as_ptr().ok_or_else(|| wrong_type(declared))?;
                lanes.ints.push(value as u64);
            }
            FfiType::CStr => match arg {
                FfiValue::String(s) => lanes.push_cstr(s, function, index)?,
                FfiValue::Pointer(p) => lanes.ints.push(*p as u64),
                _ => return Err(wrong_type(declared)),
            },
            FfiType::Buffer => match arg {
                FfiValue::Buffer(bytes) => {
                    lanes.ints.push(bytes.as_ptr() as u64);
                    lanes.ints.push(bytes.len() as u64);
                }
                _ => return Err(wrong_type(declared)),
            },
            _ => return Err(wrong_type(declared)),
        }
    }

    if lanes.ints.len() > MAX_INT_LANES || lanes.floats.len() > MAX_FLOAT_LANES {
        return Err(InvokeError::TooManyArgs {
            function: function.to_string(),
            ints: lanes.ints.len(),
            floats: lanes.floats.len(),
            max_ints: MAX_INT_LANES,
            max_floats: MAX_FLOAT_LANES,
        });
    }

    Ok(lanes)
}

fn marshal_variadic(
    lanes: &mut Lanes,
    function: &str,
    index: usize,
    arg: &FfiValue,
) -> Result<(), InvokeError> {
    let unsupported = |reason: &str| InvokeError::Unsupported {
        function: function.to_string(),
        index,
        reason: reason.to_string(),
    };

    if !VARIADIC_EXTRAS {
        return Err(unsupported("variadic arguments are not supported on this target"));
    }

    match arg {
        FfiValue::Integer(v) => lanes.ints.push(*v),
        FfiValue::Signed(v) => lanes.ints.push(*v as u64),
        FfiValue::Pointer(p) => lanes.ints.push(*p as u64),
        FfiValue::String(s) => lanes.push_cstr(s, function, index)?,
        FfiValue::Float(_) => {
            return Err(unsupported(
                "floating-point values cannot be passed through '...'",
            ))
        }
        FfiValue::Buffer(_) => return Err(unsupported("buffers cannot be passed through '...'")),
        FfiValue::Void => return Err(unsupported("void is not a value")),
    }
    Ok(())
}

/// Place an f32 in the low half of a double register.
fn pack_f32(value: f32) -> f64 {
    f64::from_bits(value.to_bits() as u64)
}

/// Narrow an integer-class return register to the declared type.
///
/// Callees only define the low bits of the register for types narrower than
/// 64 bits.
pub(crate) fn decode_int_return(raw: u64, ty: FfiType) -> FfiValue {
    match ty {
        FfiType::U8 => FfiValue::Integer(raw as u8 as u64),
        FfiType::U16 => FfiValue::Integer(raw as u16 as u64),
        FfiType::U32 => FfiValue::Integer(raw as u32 as u64),
        FfiType::I8 => FfiValue::Signed(raw as i8 as i64),
        FfiType::I16 => FfiValue::Signed(raw as i16 as i64),
        FfiType::I32 => FfiValue::Signed(raw as i32 as i64),
        FfiType::I64 => FfiValue::Signed(raw as i64),
        FfiType::Ptr | FfiType::CStr => FfiValue::Pointer(raw as usize),
        _ => FfiValue::Integer(raw),
    }
}

unsafe fn dispatch(addr: usize, return_type: FfiType, lanes: &Lanes) -> Option<FfiValue> {
    let ints = lanes.ints.as_slice();
    let floats = lanes.floats.as_slice();

    Some(match return_type {
        FfiType::Void => {
            call_void(addr, ints, floats)?;
            FfiValue::Void
        }
        FfiType::F64 => FfiValue::Float(call_f64(addr, ints, floats)?),
        FfiType::F32 => FfiValue::Float(call_f32(addr, ints, floats)? as f64),
        other => decode_int_return(call_int(addr, ints, floats)?, other),
    })
}

macro_rules! int_lane {
    ($i:tt) => {
        u64
    };
}

macro_rules! float_lane {
    ($f:tt) => {
        f64
    };
}

/// Call `$addr` as `extern "C" fn(u64 per int index, f64 per float index) -> $ret`.
macro_rules! lane_call {
    ($addr:expr, $ret:ty, $ints:ident, $floats:ident; [$($i:tt)*] [$($f:tt)*]) => {{
        let func: unsafe extern "C" fn($(int_lane!($i),)* $(float_lane!($f),)*) -> $ret =
            std::mem::transmute::<usize, _>($addr);
        func($($ints[$i],)* $($floats[$f],)*)
    }};
}

// One monomorphic call site per (int lanes, float lanes) pair. Rust needs the
// exact arity at compile time; `None` means the pair is past the table.
macro_rules! lane_dispatcher {
    ($name:ident, $ret:ty) => {
        unsafe fn $name(addr: usize, ints: &[u64], floats: &[f64]) -> Option<$ret> {
            let value = match (ints.len(), floats.len()) {
                (0, 0) => lane_call!(addr, $ret, ints, floats; [] []),
                (0, 1) => lane_call!(addr, $ret, ints, floats; [] [0]),
                (0, 2) => lane_call!(addr, $ret, ints, floats; [] [0 1]),
                (0, 3) => lane_call!(addr, $ret, ints, floats; [] [0 1 2]),
                (0, 4) => lane_call!(addr, $ret, ints, floats; [] [0 1 2 3]),
                (1, 0) => lane_call!(addr, $ret, ints, floats; [0] []),
                (1, 1) => lane_call!(addr, $ret, ints, floats; [0] [0]),
                (1, 2) => lane_call!(addr, $ret, ints, floats; [0] [0 1]),
                (1, 3) => lane_call!(addr, $ret, ints, floats; [0] [0 1 2]),
                (1, 4) => lane_call!(addr, $ret, ints, floats; [0] [0 1 2 3]),
                (2, 0) => lane_call!(addr, $ret, ints, floats; [0 1] []),
                (2, 1) => lane_call!(addr, $ret, ints, floats; [0 1] [0]),
                (2, 2) => lane_call!(addr, $ret, ints, floats; [0 1] [0 1]),
                (2, 3) => lane_call!(addr, $ret, ints, floats; [0 1] [0 1 2]),
                (2, 4) => lane_call!(addr, $ret, ints, floats; [0 1] [0 1 2 3]),
                (3, 0) => lane_call!(addr, $ret, ints, floats; [0 1 2] []),
                (3, 1) => lane_call!(addr, $ret, ints, floats; [0 1 2] [0]),
                (3, 2) => lane_call!(addr, $ret, ints, floats; [0 1 2] [0 1]),
                (3, 3) => lane_call!(addr, $ret, ints, floats; [0 1 2] [0 1 2]),
                (3, 4) => lane_call!(addr, $ret, ints, floats; [0 1 2] [0 1 2 3]),
                (4, 0) => lane_call!(addr, $ret, ints, floats; [0 1 2 3] []),
                (4, 1) => lane_call!(addr, $ret, ints, floats; [0 1 2 3] [0]),
                (4, 2) => lane_call!(addr, $ret, ints, floats; [0 1 2 3] [0 1]),
                (4, 3) => lane_call!(addr, $ret, ints, floats; [0 1 2 3] [0 1 2]),
                (4, 4) => lane_call!(addr, $ret, ints, floats; [0 1 2 3] [0 1 2 3]),
                (5, 0) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4] []),
                (5, 1) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4] [0]),
                (5, 2) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4] [0 1]),
                (5, 3) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4] [0 1 2]),
                (5, 4) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4] [0 1 2 3]),
                (6, 0) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4 5] []),
                (6, 1) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4 5] [0]),
                (6, 2) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4 5] [0 1]),
                (6, 3) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4 5] [0 1 2]),
                (6, 4) => lane_call!(addr, $ret, ints, floats; [0 1 2 3 4 5] [0 1 2 3]),
                _ => return None,
            };
            Some(value)
        }
    };
}

lane_dispatcher!(call_void, ());
lane_dispatcher!(call_int, u64);
lane_dispatcher!(call_f64, f64);
lane_dispatcher!(call_f32, f32);
