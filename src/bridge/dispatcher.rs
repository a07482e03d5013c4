//! Executes `ExecuteMethod` messages: resolve, reflect, invoke, reply.
//!
//! Nothing here survives between calls; all state lives in the context.

use tracing::{debug, trace, warn};

use crate::codec::ParamSpec;
use crate::error::BridgeError;
use crate::message::BridgeMessage;
use crate::value::TypedValue;

use super::callback::ScriptResponse;
use super::context::ScriptingContext;
use super::invokable::{MethodCall, MethodSpec};

enum Outcome {
    Replied(Option<TypedValue>),
    Deferred,
}

pub(crate) fn execute(context: &ScriptingContext, message: BridgeMessage) {
    let reply_to = message.reply_to;
    match invoke(context, message) {
        Ok(Outcome::Replied(value)) => {
            if let Some(id) = reply_to {
                context.post(BridgeMessage::callback_result(
                    id,
                    value.into_iter().collect(),
                    false,
                ));
            }
        }
        Ok(Outcome::Deferred) => {}
        Err(err) => {
            debug!(target: "bridge", %err, "method call failed");
            if let Some(id) = reply_to {
                context.post(BridgeMessage::error_result(id, &err));
            }
        }
    }
}

fn invoke(context: &ScriptingContext, message: BridgeMessage) -> Result<Outcome, BridgeError> {
    let method_name = message
        .method
        .as_deref()
        .ok_or_else(|| BridgeError::Decode("ExecuteMethod without a method name".into()))?;

    let target = context.resolve_target(&message.target)?;
    let spec = target
        .object
        .find_method(method_name, context.lowercase_names())
        .ok_or_else(|| BridgeError::UnknownMethod {
            target: target.label.clone(),
            method: method_name.to_string(),
        })?;
    check_arguments(spec, &message.payload)?;

    trace!(target: "bridge", object = %target.label, method = spec.name, "invoking");

    let response = spec.response.then(|| {
        let response = ScriptResponse::new(message.reply_to, context.weak());
        if let Some((binding, generation)) = &target.binding {
            context.track_response(binding, *generation, &response);
        }
        response
    });

    let call = MethodCall::new(message.payload)
        .with_response(response.clone())
        .with_scope(context.decode_scope());

    match target.object.invoke(spec, call) {
        Ok(_) if spec.response => Ok(Outcome::Deferred),
        Ok(value) => Ok(Outcome::Replied(value)),
        Err(err) => match &response {
            // A successful cancel lets the error reply settle the call.
            // Otherwise the method already finished and that was the reply.
            Some(response) if !response.cancel() => {
                warn!(
                    target: "bridge",
                    method = spec.name,
                    %err,
                    "method failed after finishing its response"
                );
                Ok(Outcome::Deferred)
            }
            _ => Err(err),
        },
    }
}

/// Validates argument count and wire tags against the declared parameters.
/// Missing trailing arguments are allowed when their parameters are nullable.
fn check_arguments(spec: &MethodSpec, args: &[TypedValue]) -> Result<(), BridgeError> {
    let expected = spec.params.len();
    let actual = args.len();
    let missing_required = spec
        .params
        .get(actual..)
        .is_some_and(|rest| rest.iter().any(|param| !param.nullable));
    if actual > expected || missing_required {
        return Err(BridgeError::ArgCountMismatch {
            method: spec.name.to_string(),
            expected,
            actual,
        });
    }

    for (index, (param, value)) in spec.params.iter().zip(args).enumerate() {
        if !param.accepts(value) {
            return Err(mismatch(spec, index, param, value));
        }
    }
    Ok(())
}

fn mismatch(spec: &MethodSpec, index: usize, param: &ParamSpec, value: &TypedValue) -> BridgeError {
    BridgeError::TypeMismatch(format!(
        "argument {index} of '{}' expects {}, found {}",
        spec.name,
        param.kind.name(),
        value.tag()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParamKind;

    const SPEC: MethodSpec = MethodSpec {
        name: "move_to",
        params: &[
            ParamSpec::new(ParamKind::Float),
            ParamSpec::new(ParamKind::Float),
            ParamSpec {
                kind: ParamKind::String,
                nullable: true,
            },
        ],
        response: false,
    };

    #[test]
    fn accepts_matching_arguments() {
        assert!(check_arguments(&SPEC, &[1.into(), 2.5.into(), "ease".into()]).is_ok());
        assert!(check_arguments(&SPEC, &[1.into(), 2.5.into(), TypedValue::Null]).is_ok());
        assert!(check_arguments(&SPEC, &[1.into(), 2.5.into()]).is_ok());
    }

    #[test]
    fn rejects_wrong_counts() {
        let err = check_arguments(&SPEC, &[1.into()]).unwrap_err();
        assert_eq!(
            err,
            BridgeError::ArgCountMismatch {
                method: "move_to".into(),
                expected: 3,
                actual: 1,
            }
        );
        let too_many = vec![TypedValue::Int(0); 4];
        assert!(matches!(
            check_arguments(&SPEC, &too_many),
            Err(BridgeError::ArgCountMismatch { actual: 4, .. })
        ));
    }

    #[test]
    fn rejects_wrong_tags() {
        let err = check_arguments(&SPEC, &[1.into(), true.into()]).unwrap_err();
        assert_eq!(
            err,
            BridgeError::TypeMismatch("argument 1 of 'move_to' expects float, found bool".into())
        );
    }
}
