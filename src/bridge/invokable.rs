use std::sync::Arc;

use crate::codec::{BridgeDecode, DecodeScope, ParamSpec};
use crate::error::BridgeError;
use crate::value::{ObjectHandle, TypedValue};

use super::callback::{ScriptFunction, ScriptResponse};

/// Reflection entry for one script-callable method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    /// Declared parameters, excluding the trailing response of async methods.
    pub params: &'static [ParamSpec],
    /// Async methods receive a [`ScriptResponse`] and reply through it.
    pub response: bool,
}

/// A host object that can be bound into a page.
///
/// Implement it by hand, or use [`bridge_object!`](crate::bridge_object) to
/// generate the method table and argument decoding.
pub trait Invokable: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    fn methods(&self) -> &'static [MethodSpec];

    /// Runs `method`, whose arguments have already been checked against its
    /// declared parameters. Synchronous methods return their reply value.
    fn invoke(
        &self,
        method: &MethodSpec,
        call: MethodCall,
    ) -> Result<Option<TypedValue>, BridgeError>;

    fn find_method(&self, name: &str, ignore_case: bool) -> Option<&'static MethodSpec> {
        self.methods().iter().find(|spec| {
            if ignore_case {
                spec.name.eq_ignore_ascii_case(name)
            } else {
                spec.name == name
            }
        })
    }
}

/// Arguments and context for a single invocation.
pub struct MethodCall {
    args: Vec<TypedValue>,
    response: Option<ScriptResponse>,
    scope: DecodeScope,
    cursor: usize,
}

impl MethodCall {
    pub fn new(args: Vec<TypedValue>) -> Self {
        Self {
            args,
            response: None,
            scope: DecodeScope::detached(),
            cursor: 0,
        }
    }

    pub fn with_response(mut self, response: Option<ScriptResponse>) -> Self {
        self.response = response;
        self
    }

    pub(crate) fn with_scope(mut self, scope: DecodeScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn args(&self) -> &[TypedValue] {
        &self.args
    }

    /// Decodes argument `index`. Absent trailing arguments decode as their
    /// type's missing value (`None` for options).
    pub fn arg<T: BridgeDecode>(&self, index: usize) -> Result<T, BridgeError> {
        match self.args.get(index) {
            Some(value) => T::decode_in(value, &self.scope).map_err(|err| {
                BridgeError::TypeMismatch(format!("argument {index}: {err}"))
            }),
            None => T::missing().ok_or(BridgeError::ArgCountMismatch {
                method: String::from("<call>"),
                expected: index + 1,
                actual: self.args.len(),
            }),
        }
    }

    pub fn next_arg<T: BridgeDecode>(&mut self) -> Result<T, BridgeError> {
        let value = self.arg(self.cursor)?;
        self.cursor += 1;
        Ok(value)
    }

    pub fn function(&self, index: usize) -> Result<ScriptFunction, BridgeError> {
        self.arg(index)
    }

    /// Takes the response handle. Calls without a reply id get a detached one.
    pub fn take_response(&mut self) -> ScriptResponse {
        self.response.take().unwrap_or_else(ScriptResponse::detached)
    }

    /// Hands `object` to the calling page and returns its handle.
    ///
    /// Exposed objects stay alive until the page releases them or navigates.
    pub fn expose(&self, object: Arc<dyn Invokable>) -> Option<ObjectHandle> {
        let context = self.scope.owner().upgrade()?;
        Some(context.expose_object(object))
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __bridge_return {
    ($value:ident) => {{
        let () = $value;
        None
    }};
    ($value:ident, $ret:ty) => {
        Some($crate::codec::BridgeEncode::encode(&$value))
    };
}

/// Implements [`Invokable`] for a type by listing the inherent methods to
/// expose.
///
/// Synchronous methods come first; their arguments are decoded with the
/// codec and their return value is sent back as the reply. Methods listed
/// after them with `async fn` take a trailing [`ScriptResponse`] and reply
/// through it.
///
/// ```ignore
/// pagebridge::bridge_object! {
///     impl Calculator as "Calc" {
///         fn add(a: i64, b: i64) -> i64;
///         fn clear();
///         async fn slow_add(a: i64, b: i64);
///     }
/// }
/// ```
#[macro_export]
macro_rules! bridge_object {
    (
        impl $ty:ty as $name:literal {
            $( fn $method:ident ( $( $arg:ident : $argty:ty ),* $(,)? ) $( -> $ret:ty )? ; )*
            $( async fn $amethod:ident ( $( $aarg:ident : $aargty:ty ),* $(,)? ) ; )*
        }
    ) => {
        impl $crate::bridge::invokable::Invokable for $ty {
            fn type_name(&self) -> &'static str {
                $name
            }

            fn methods(&self) -> &'static [$crate::bridge::invokable::MethodSpec] {
                const METHODS: &[$crate::bridge::invokable::MethodSpec] = &[
                    $(
                        $crate::bridge::invokable::MethodSpec {
                            name: stringify!($method),
                            params: &[ $( $crate::codec::ParamSpec::of::<$argty>() ),* ],
                            response: false,
                        },
                    )*
                    $(
                        $crate::bridge::invokable::MethodSpec {
                            name: stringify!($amethod),
                            params: &[ $( $crate::codec::ParamSpec::of::<$aargty>() ),* ],
                            response: true,
                        },
                    )*
                ];
                METHODS
            }

            #[allow(unused_mut, unused_variables)]
            fn invoke(
                &self,
                method: &$crate::bridge::invokable::MethodSpec,
                mut call: $crate::bridge::invokable::MethodCall,
            ) -> ::std::result::Result<
                ::std::option::Option<$crate::value::TypedValue>,
                $crate::error::BridgeError,
            > {
                $(
                    if method.name == stringify!($method) {
                        $( let $arg: $argty = call.next_arg()?; )*
                        let result = self.$method($($arg),*);
                        return Ok($crate::__bridge_return!(result $(, $ret)?));
                    }
                )*
                $(
                    if method.name == stringify!($amethod) {
                        $( let $aarg: $aargty = call.next_arg()?; )*
                        let response = call.take_response();
                        self.$amethod($($aarg,)* response);
                        return Ok(None);
                    }
                )*
                Err($crate::error::BridgeError::UnknownMethod {
                    target: $name.to_string(),
                    method: method.name.to_string(),
                })
            }
        }
    };
}
