//! Method dispatch: resolve an invocation to a handler, validate its
//! arguments, run it, and route the reply.
//!
//! Replies go only to the invoking session and echo its `invoke_id`
//! verbatim. Handler failures never escape: a `MethodException` passes
//! through to the client, anything else is logged and reported as an
//! internal error.

use serde_cbor::Value;
use uuid::Uuid;

use crate::components::{Component, MethodArg};
use crate::ids::{ComponentId, EntityId, PlotId, TableId};
use crate::protocol::{
    InvokeContext, InvokeRequest, MethodException, Reply, TaggedMessage, TAG_METHOD_REPLY,
};
use crate::server::ServerState;

/// Names of the built-in table-mutation methods routed through the table's
/// delegate when no user handler is registered.
pub const TBL_SUBSCRIBE: &str = "noo::tbl_subscribe";
pub const TBL_INSERT: &str = "noo::tbl_insert";
pub const TBL_UPDATE: &str = "noo::tbl_update";
pub const TBL_REMOVE: &str = "noo::tbl_remove";
pub const TBL_CLEAR: &str = "noo::tbl_clear";
pub const TBL_UPDATE_SELECTION: &str = "noo::tbl_update_selection";

/// The component (or document) a method or signal runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodContext {
    Document,
    Entity(EntityId),
    Table(TableId),
    Plot(PlotId),
}

impl MethodContext {
    pub fn component_id(&self) -> Option<ComponentId> {
        match *self {
            MethodContext::Document => None,
            MethodContext::Entity(id) => Some(id.into()),
            MethodContext::Table(id) => Some(id.into()),
            MethodContext::Plot(id) => Some(id.into()),
        }
    }

    pub fn to_invoke_context(&self) -> Option<InvokeContext> {
        match *self {
            MethodContext::Document => None,
            MethodContext::Entity(id) => Some(InvokeContext::Entity(id)),
            MethodContext::Table(id) => Some(InvokeContext::Table(id)),
            MethodContext::Plot(id) => Some(InvokeContext::Plot(id)),
        }
    }
}

impl From<Option<InvokeContext>> for MethodContext {
    fn from(context: Option<InvokeContext>) -> Self {
        match context {
            None => MethodContext::Document,
            Some(InvokeContext::Entity(id)) => MethodContext::Entity(id),
            Some(InvokeContext::Table(id)) => MethodContext::Table(id),
            Some(InvokeContext::Plot(id)) => MethodContext::Plot(id),
        }
    }
}

/// Run one client invocation and, when it carried an `invoke_id`, enqueue
/// exactly one reply to the invoking session. Broadcasts the handler emitted
/// are already queued by the time the reply is.
pub fn handle_invoke(state: &mut ServerState, session: Uuid, invoke: InvokeRequest) {
    let result = run_invoke(state, &invoke);

    let Some(invoke_id) = invoke.invoke_id.clone() else {
        if let Err(err) = result {
            log::warn!("uncorrelated invocation of {} failed: {err}", invoke.method);
        }
        return;
    };

    let reply = match result {
        Ok(value) => Reply {
            invoke_id,
            result: Some(value),
            method_exception: None,
        },
        Err(exception) => Reply {
            invoke_id,
            result: None,
            method_exception: Some(exception),
        },
    };
    match TaggedMessage::new(TAG_METHOD_REPLY, &reply) {
        Ok(message) => {
            if let Err(err) = state.send_to_session(session, &message) {
                log::error!("failed to enqueue reply: {err}");
            }
        }
        Err(err) => log::error!("failed to encode reply: {err}"),
    }
}

fn run_invoke(state: &mut ServerState, invoke: &InvokeRequest) -> Result<Value, MethodException> {
    // Resolve the method; a stale or deleted ID is indistinguishable from an
    // unknown one.
    let method = match state.get_component(invoke.method) {
        Ok(Component::Method(m)) => m.clone(),
        _ => return Err(MethodException::method_not_found()),
    };

    let context = MethodContext::from(invoke.context);
    check_attachment(state, &context, invoke.method.into())?;
    validate_args(&method.arg_doc, &invoke.args)?;

    if let Some(handler) = state.handlers.get(&invoke.method).cloned() {
        return handler(state, context, &invoke.args).map_err(|err| {
            if err.code == crate::protocol::exception_codes::INTERNAL_ERROR {
                log::error!("handler for '{}' failed: {err}", method.name);
            }
            err
        });
    }

    if let MethodContext::Table(table) = context {
        return table_builtin(state, table, &method.name, &invoke.args);
    }

    Err(MethodException::method_not_found())
}

/// A non-document context must be live and carry the method in its
/// `methods_list`.
fn check_attachment(
    state: &ServerState,
    context: &MethodContext,
    method: ComponentId,
) -> Result<(), MethodException> {
    let Some(target) = context.component_id() else {
        return Ok(());
    };
    let component = state
        .get_component(target)
        .map_err(|_| MethodException::method_not_found())?;
    let attached = component
        .methods_list()
        .is_some_and(|list| list.iter().any(|&m| ComponentId::from(m) == method));
    if attached {
        Ok(())
    } else {
        Err(MethodException::method_not_found())
    }
}

/// Arity must match a non-empty `arg_doc` exactly; an empty `arg_doc` leaves
/// the argument list unchecked (the built-ins are registered that way).
/// Editor hints add shape checks where recognized.
fn validate_args(arg_doc: &[MethodArg], args: &[Value]) -> Result<(), MethodException> {
    if arg_doc.is_empty() {
        return Ok(());
    }
    if args.len() != arg_doc.len() {
        return Err(MethodException::invalid_parameters(format!(
            "expected {} argument(s), got {}",
            arg_doc.len(),
            args.len()
        )));
    }
    for (doc, arg) in arg_doc.iter().zip(args) {
        if let Some(hint) = &doc.editor_hint {
            if !hint_matches(hint, arg) {
                return Err(MethodException::invalid_parameters(format!(
                    "argument '{}' does not match hint {hint}",
                    doc.name
                )));
            }
        }
    }
    Ok(())
}

fn hint_matches(hint: &str, value: &Value) -> bool {
    match hint {
        "noo::real" => matches!(value, Value::Integer(_) | Value::Float(_)),
        "noo::integer" => matches!(value, Value::Integer(_)),
        "noo::text" | "noo::string" => matches!(value, Value::Text(_)),
        "noo::array" => matches!(value, Value::Array(_)),
        // Unrecognized hints are advisory only.
        _ => true,
    }
}

fn delegate_ops<'a>(
    state: &'a mut ServerState,
    table: TableId,
) -> Result<&'a mut dyn crate::delegate::TableOps, MethodException> {
    state
        .table_ops(table)
        .ok_or_else(MethodException::method_not_found)
}

fn table_builtin(
    state: &mut ServerState,
    table: TableId,
    name: &str,
    args: &[Value],
) -> Result<Value, MethodException> {
    let change = match name {
        TBL_SUBSCRIBE => {
            let init = delegate_ops(state, table)?.init_data();
            return serde_cbor::value::to_value(&init)
                .map_err(|_| MethodException::internal_error());
        }
        TBL_INSERT => {
            let rows: Vec<Vec<Value>> = arg_at(args, 0, "rows")?;
            delegate_ops(state, table)?.handle_insert(rows)?
        }
        TBL_UPDATE => {
            let keys: Vec<i64> = arg_at(args, 0, "keys")?;
            let rows: Vec<Vec<Value>> = arg_at(args, 1, "rows")?;
            delegate_ops(state, table)?.handle_update(keys, rows)?
        }
        TBL_REMOVE => {
            let keys: Vec<i64> = arg_at(args, 0, "keys")?;
            delegate_ops(state, table)?.handle_remove(keys)?
        }
        TBL_CLEAR => delegate_ops(state, table)?.handle_clear()?,
        TBL_UPDATE_SELECTION => {
            let selection = arg_at(args, 0, "selection")?;
            delegate_ops(state, table)?.handle_update_selection(selection)?
        }
        _ => return Err(MethodException::method_not_found()),
    };

    let reply = change.reply_value();
    state
        .broadcast_table_change(table, &change)
        .map_err(MethodException::from)?;
    Ok(reply)
}

fn arg_at<T: serde::de::DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<T, MethodException> {
    let value = args
        .get(index)
        .ok_or_else(|| MethodException::invalid_parameters(format!("missing argument '{name}'")))?;
    serde_cbor::value::from_value(value.clone())
        .map_err(|_| MethodException::invalid_parameters(format!("malformed argument '{name}'")))
}
