use std::fmt;

use crate::error::SiftError;
use crate::value::Value;

/// Implementation signature for a native function: the implicit input value
/// plus the already-evaluated explicit arguments.
pub type NativeFnInner = dyn Fn(&Value, &[Value]) -> Result<Value, SiftError>;

/// A native (host-implemented) function callable from sift code.
///
/// `arity` counts the implicit input, so a builtin taking no explicit
/// arguments has `arity = 1`.
pub struct NativeFn {
    pub name: String,
    pub arity: u16,
    pub func: Box<NativeFnInner>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<String>,
        arity: u16,
        f: impl Fn(&Value, &[Value]) -> Result<Value, SiftError> + 'static,
    ) -> Self {
        NativeFn {
            name: name.into(),
            arity,
            func: Box::new(f),
        }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native-fn {}/{}>", self.name, self.arity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_call() {
        let length = NativeFn::new("length", 1, |input, _args| {
            let n = match input {
                Value::Array(items) => items.len(),
                Value::String(s) => s.chars().count(),
                other => {
                    return Err(SiftError::type_error(
                        "array or string",
                        crate::value::kind_of(other).to_string(),
                    ))
                }
            };
            Ok(Value::from(n))
        });
        let out = (length.func)(&serde_json::json!([1, 2, 3]), &[]).unwrap();
        assert_eq!(out, serde_json::json!(3));
        assert_eq!(format!("{length:?}"), "<native-fn length/1>");
    }
}
