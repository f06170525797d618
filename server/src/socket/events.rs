use std::sync::Arc;
use std::time::Instant;

use corelay_core::user::UserSnapshot;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use socketioxide::SocketIo;
use socketioxide::extract::{Data, Extension, SocketRef};
use socketioxide::handler::ConnectHandler;
use tracing::{debug, warn};

use crate::agenda::TaskEvent;
use crate::error::AppError;
use crate::socket::auth::SocketAuthMiddleware;
use crate::socket::rooms::Scope;
use crate::socket::types::{SocketUserContext, emit_error, emit_to_socket, parse_payload};
use crate::state::AppState;

pub(crate) fn register_namespace(io: &SocketIo, state: Arc<AppState>) {
    let middleware = SocketAuthMiddleware::new(state);
    let _ = io.ns("/", on_connect.with(middleware));
}

async fn on_connect(socket: SocketRef) {
    socket.on("join_workspace", handle_join_workspace);
    socket.on("leave_workspace", handle_leave_workspace);
    socket.on("get_workspace_users", handle_get_workspace_users);

    socket.on("join_collection", handle_join_collection);
    socket.on("leave_collection", handle_leave_collection);
    socket.on("get_collections_users", handle_get_collections_users);

    socket.on("new_message", handle_new_message);
    socket.on("user_typing", handle_user_typing);
    socket.on("user_stop_typing", handle_user_stop_typing);
    socket.on("get_chat_history", handle_get_chat_history);

    socket.on("join_note", handle_join_note);
    socket.on("leave_note", handle_leave_note);
    socket.on("cursor_update", handle_cursor_update);
    socket.on("note_content_update", handle_note_content_update);

    socket.on("join_agenda", handle_join_agenda);
    socket.on("leave_agenda", handle_leave_agenda);
    socket.on("get_agenda_users", handle_get_agenda_users);
    socket.on("task_created", handle_task_created);
    socket.on("task_updated", handle_task_updated);
    socket.on("task_deleted", handle_task_deleted);
    socket.on("task_moved", handle_task_moved);

    socket.on_disconnect(handle_disconnect);
}

fn reject(state: &AppState, socket: &SocketRef, error: AppError) {
    state.metrics.error_occurred(error.kind());
    emit_error(socket, &error);
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

// ---- workspace presence ---------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinWorkspacePayload {
    workspace_id: String,
    user: UserSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspacePayload {
    workspace_id: String,
}

async fn handle_join_workspace(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: JoinWorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let room = Scope::workspace(&payload.workspace_id).room_name();
    socket.join(room.clone());

    let outcome = state
        .workspaces
        .apply_join(
            &payload.workspace_id,
            &socket.id.to_string(),
            payload.user.clone(),
        )
        .await;

    if outcome.first_join {
        if let Err(err) = socket
            .broadcast()
            .to(room)
            .emit("user_joined", &json!(payload.user))
            .await
        {
            warn!(?err, "failed to broadcast user_joined");
        }
    }

    state
        .metrics
        .message_processed("join_workspace", elapsed_ms(started));
}

async fn handle_leave_workspace(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.leave(Scope::workspace(&payload.workspace_id).room_name());
    state
        .workspaces
        .apply_leave(&payload.workspace_id, &socket.id.to_string())
        .await;

    state
        .metrics
        .message_processed("leave_workspace", elapsed_ms(started));
}

async fn handle_get_workspace_users(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let users = state.workspaces.current_users(&payload.workspace_id).await;
    emit_to_socket(&socket, "users_connected", &json!(users));

    state
        .metrics
        .message_processed("get_workspace_users", elapsed_ms(started));
}

// ---- collection presence --------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinCollectionPayload {
    workspace_id: String,
    collection_id: String,
    user: UserSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionPayload {
    workspace_id: String,
    collection_id: String,
}

async fn handle_join_collection(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: JoinCollectionPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.join(Scope::collection(&payload.workspace_id, &payload.collection_id).room_name());
    state
        .collections
        .apply_join(
            &payload.workspace_id,
            &payload.collection_id,
            &socket.id.to_string(),
            payload.user,
        )
        .await;

    state
        .metrics
        .message_processed("join_collection", elapsed_ms(started));
}

async fn handle_leave_collection(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: CollectionPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.leave(Scope::collection(&payload.workspace_id, &payload.collection_id).room_name());
    state
        .collections
        .apply_leave(
            &payload.workspace_id,
            &payload.collection_id,
            &socket.id.to_string(),
        )
        .await;

    state
        .metrics
        .message_processed("leave_collection", elapsed_ms(started));
}

async fn handle_get_collections_users(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    for (collection_id, users) in state.collections.collections_of(&payload.workspace_id).await {
        emit_to_socket(
            &socket,
            "collection_users_updated",
            &json!({ "collectionId": collection_id, "users": users }),
        );
    }

    state
        .metrics
        .message_processed("get_collections_users", elapsed_ms(started));
}

// ---- chat -----------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    workspace_id: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
}

async fn handle_new_message(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    match state.chat.post_message(payload).await {
        Ok(message) => {
            debug!(message_id = %message.id, workspace_id = %message.workspace_id, "chat message fanned out");
            state
                .metrics
                .message_processed("new_message", elapsed_ms(started));
        }
        Err(err) => reject(&state, &socket, err),
    }
}

async fn handle_user_typing(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: TypingPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let name = payload.name.unwrap_or_else(|| payload.email.clone());
    state
        .chat
        .user_typing(&payload.workspace_id, &payload.email, &name)
        .await;

    state
        .metrics
        .message_processed("user_typing", elapsed_ms(started));
}

async fn handle_user_stop_typing(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: TypingPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    state
        .chat
        .user_stop_typing(&payload.workspace_id, &payload.email)
        .await;

    state
        .metrics
        .message_processed("user_stop_typing", elapsed_ms(started));
}

async fn handle_get_chat_history(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let messages = state.chat.history(&payload.workspace_id).await;
    emit_to_socket(&socket, "chat_history", &json!(messages));

    state
        .metrics
        .message_processed("get_chat_history", elapsed_ms(started));
}

// ---- notes ----------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinNotePayload {
    workspace_id: String,
    note_id: String,
    user: UserSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotePayload {
    workspace_id: String,
    note_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    workspace_id: String,
    note_id: String,
    #[serde(default)]
    cursor: JsonValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteContentPayload {
    workspace_id: String,
    note_id: String,
    content: String,
}

async fn handle_join_note(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: JoinNotePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.join(Scope::note(&payload.workspace_id, &payload.note_id).room_name());
    let join = state
        .notes
        .apply_join(
            &payload.workspace_id,
            &payload.note_id,
            &socket.id.to_string(),
            payload.user,
        )
        .await;

    emit_to_socket(
        &socket,
        "note_content_loaded",
        &json!({ "noteId": payload.note_id, "content": join.content }),
    );

    state
        .metrics
        .message_processed("join_note", elapsed_ms(started));
}

async fn handle_leave_note(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: NotePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.leave(Scope::note(&payload.workspace_id, &payload.note_id).room_name());
    state
        .notes
        .apply_leave(
            &payload.workspace_id,
            &payload.note_id,
            &socket.id.to_string(),
        )
        .await;

    state
        .metrics
        .message_processed("leave_note", elapsed_ms(started));
}

async fn handle_cursor_update(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: CursorPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    // Unknown sessions are dropped without an error event.
    state
        .notes
        .cursor_update(
            &payload.workspace_id,
            &payload.note_id,
            &socket.id.to_string(),
            payload.cursor,
        )
        .await;

    state
        .metrics
        .message_processed("cursor_update", elapsed_ms(started));
}

async fn handle_note_content_update(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: NoteContentPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let accepted = state
        .notes
        .content_update(&payload.workspace_id, &payload.note_id, &payload.content)
        .await;

    if accepted {
        let room = Scope::note(&payload.workspace_id, &payload.note_id).room_name();
        if let Err(err) = socket
            .broadcast()
            .to(room)
            .emit(
                "note_content_updated",
                &json!({
                    "noteId": payload.note_id,
                    "content": payload.content,
                    "updatedBy": socket.id.to_string(),
                }),
            )
            .await
        {
            warn!(?err, "failed to broadcast note_content_updated");
        }
    }

    state
        .metrics
        .message_processed("note_content_update", elapsed_ms(started));
}

// ---- agenda / tasks -------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinAgendaPayload {
    workspace_id: String,
    user: UserSnapshot,
}

async fn handle_join_agenda(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: JoinAgendaPayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.join(Scope::agenda(&payload.workspace_id).room_name());
    state
        .agenda
        .apply_join(&payload.workspace_id, &socket.id.to_string(), payload.user)
        .await;

    state
        .metrics
        .message_processed("join_agenda", elapsed_ms(started));
}

async fn handle_leave_agenda(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    socket.leave(Scope::agenda(&payload.workspace_id).room_name());
    state
        .agenda
        .apply_leave(&payload.workspace_id, &socket.id.to_string())
        .await;

    state
        .metrics
        .message_processed("leave_agenda", elapsed_ms(started));
}

async fn handle_get_agenda_users(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let started = Instant::now();
    let payload: WorkspacePayload = match parse_payload(raw) {
        Ok(payload) => payload,
        Err(err) => return reject(&state, &socket, err),
    };

    let users = state.agenda.current_users(&payload.workspace_id).await;
    emit_to_socket(&socket, "agenda_users_updated", &json!({ "users": users }));

    state
        .metrics
        .message_processed("get_agenda_users", elapsed_ms(started));
}

async fn fan_out_task(
    kind: TaskEvent,
    socket: SocketRef,
    raw: JsonValue,
    state: Arc<AppState>,
) {
    let started = Instant::now();
    let (workspace_id, payload) = match state.agenda.enrich_task_payload(raw) {
        Ok(enriched) => enriched,
        Err(err) => return reject(&state, &socket, err),
    };

    let agenda_room = Scope::agenda(&workspace_id).room_name();
    if let Err(err) = socket
        .broadcast()
        .to(agenda_room)
        .emit(kind.agenda_event(), &payload)
        .await
    {
        warn!(event = kind.agenda_event(), ?err, "failed to broadcast task event");
    }

    // Twin into the workspace room so off-agenda clients track changes.
    let workspace_room = Scope::workspace(&workspace_id).room_name();
    if let Err(err) = socket
        .broadcast()
        .to(workspace_room)
        .emit(kind.workspace_event(), &payload)
        .await
    {
        warn!(event = kind.workspace_event(), ?err, "failed to broadcast task twin");
    }

    state
        .metrics
        .message_processed(kind.agenda_event(), elapsed_ms(started));
}

async fn handle_task_created(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    fan_out_task(TaskEvent::Created, socket, raw, state).await;
}

async fn handle_task_updated(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    fan_out_task(TaskEvent::Updated, socket, raw, state).await;
}

async fn handle_task_deleted(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    fan_out_task(TaskEvent::Deleted, socket, raw, state).await;
}

async fn handle_task_moved(
    socket: SocketRef,
    Data(raw): Data<JsonValue>,
    Extension(state): Extension<Arc<AppState>>,
) {
    fan_out_task(TaskEvent::Moved, socket, raw, state).await;
}

// ---- disconnect -----------------------------------------------------

async fn handle_disconnect(
    socket: SocketRef,
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<SocketUserContext>,
) {
    let session_id = socket.id.to_string();
    debug!(session_id = %session_id, user_id = %user.user.id, "session disconnected");

    // Workspace presence lingers through the grace window; typing
    // state and the other scopes drop immediately.
    let memberships = state.workspaces.sessions_of(&session_id);
    let armed = state.workspaces.schedule_disconnect(&session_id);
    if armed > 0 {
        debug!(session_id = %session_id, timers = armed, "reconnect grace timers armed");
    }

    for (workspace_id, email) in memberships {
        state.chat.clear_typing(&workspace_id, &email).await;
    }

    state.collections.handle_disconnect(&session_id).await;
    state.notes.handle_disconnect(&session_id).await;
    state.agenda.handle_disconnect(&session_id).await;

    state.metrics.connection_closed();
}
