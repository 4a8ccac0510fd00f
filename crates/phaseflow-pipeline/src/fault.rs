//! Fault reporting and the reverse unwind over executed interceptors.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use phaseflow_types::{Fault, FaultListener, FaultSink, Interceptor, Message};
use uuid::Uuid;

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Hand the fault to the message's [`FaultListener`], if any, and fall back to
/// default logging unless the listener declines it.
pub(crate) fn report(chain_id: Uuid, fault: &Fault, message: &Message) {
    let description = match &fault.interceptor_id {
        Some(id) => format!("Interceptor for {id} in chain {chain_id} has thrown exception, unwinding now"),
        None => format!("Chain {chain_id} was aborted, unwinding now"),
    };
    let default_logging = match message.get::<Arc<dyn FaultListener>>() {
        Some(listener) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.fault_occurred(fault, &description, message)
            }));
            outcome.unwrap_or_else(|payload| {
                tracing::error!(
                    chain = %chain_id,
                    panic = %panic_message(payload.as_ref()),
                    "Fault listener panicked; using default logging"
                );
                true
            })
        }
        None => true,
    };
    if !default_logging {
        return;
    }
    if fault.mode.is_expected() {
        tracing::debug!(
            chain = %chain_id,
            step = fault.interceptor_id.as_deref().unwrap_or("-"),
            position = ?fault.position,
            fault = %fault,
            "{description}"
        );
    } else {
        tracing::warn!(
            chain = %chain_id,
            step = fault.interceptor_id.as_deref().unwrap_or("-"),
            position = ?fault.position,
            mode = ?fault.mode,
            fault = %fault,
            "{description}"
        );
    }
}

/// Call `handle_fault` on each interceptor in the given (already reversed)
/// order. Errors and panics are logged; the walk always reaches the end.
pub(crate) fn unwind(chain_id: Uuid, executed: &[Arc<dyn Interceptor>], message: &mut Message) {
    for interceptor in executed {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| interceptor.handle_fault(message)));
        match outcome {
            Ok(Ok(())) => {
                tracing::trace!(chain = %chain_id, step = interceptor.id(), "Fault handler ran");
            }
            Ok(Err(err)) => {
                tracing::error!(
                    chain = %chain_id,
                    step = interceptor.id(),
                    phase = interceptor.phase(),
                    error = %err,
                    "Fault handler failed; continuing unwind"
                );
            }
            Err(payload) => {
                tracing::error!(
                    chain = %chain_id,
                    step = interceptor.id(),
                    phase = interceptor.phase(),
                    panic = %panic_message(payload.as_ref()),
                    "Fault handler panicked; continuing unwind"
                );
            }
        }
    }
}

/// Deliver a fault that no in-chain fault handler covered.
pub(crate) fn deliver_unhandled(
    chain_id: Uuid,
    sink: Option<&Arc<dyn FaultSink>>,
    message: &mut Message,
    fault: &Fault,
) {
    match sink {
        Some(sink) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.on_fault(message, fault)));
            if let Err(payload) = outcome {
                tracing::error!(
                    chain = %chain_id,
                    message_id = %message.id(),
                    panic = %panic_message(payload.as_ref()),
                    "Fault sink panicked: {fault}"
                );
            }
        }
        None => tracing::error!(
            chain = %chain_id,
            message_id = %message.id(),
            step = fault.interceptor_id.as_deref().unwrap_or("-"),
            phase = fault.phase.as_deref().unwrap_or("-"),
            position = ?fault.position,
            causes = ?fault.causes,
            "Unhandled fault: {fault}"
        ),
    }
}
