//! Room naming and shared-store key layout for the four scope kinds.

/// A fan-out scope a session can join. Room names are the transport
/// identifiers; store keys address the mirrored presence state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Workspace {
        workspace_id: String,
    },
    Collection {
        workspace_id: String,
        collection_id: String,
    },
    Note {
        workspace_id: String,
        note_id: String,
    },
    Agenda {
        workspace_id: String,
    },
}

impl Scope {
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Scope::Workspace {
            workspace_id: workspace_id.into(),
        }
    }

    pub fn collection(workspace_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Scope::Collection {
            workspace_id: workspace_id.into(),
            collection_id: collection_id.into(),
        }
    }

    pub fn note(workspace_id: impl Into<String>, note_id: impl Into<String>) -> Self {
        Scope::Note {
            workspace_id: workspace_id.into(),
            note_id: note_id.into(),
        }
    }

    pub fn agenda(workspace_id: impl Into<String>) -> Self {
        Scope::Agenda {
            workspace_id: workspace_id.into(),
        }
    }

    pub fn workspace_id(&self) -> &str {
        match self {
            Scope::Workspace { workspace_id }
            | Scope::Collection { workspace_id, .. }
            | Scope::Note { workspace_id, .. }
            | Scope::Agenda { workspace_id } => workspace_id,
        }
    }

    /// Transport room this scope fans out through.
    pub fn room_name(&self) -> String {
        match self {
            Scope::Workspace { workspace_id } => workspace_id.clone(),
            Scope::Collection {
                workspace_id,
                collection_id,
            } => format!("{workspace_id}:{collection_id}"),
            Scope::Note {
                workspace_id,
                note_id,
            } => format!("note:{workspace_id}:{note_id}"),
            Scope::Agenda { workspace_id } => format!("agenda:{workspace_id}"),
        }
    }

    /// Shared-store key holding this scope's presence record.
    pub fn store_key(&self) -> String {
        match self {
            Scope::Workspace { workspace_id } => format!("workspace:{workspace_id}:users"),
            Scope::Collection {
                workspace_id,
                collection_id,
            } => format!("collection:{workspace_id}:{collection_id}:users"),
            Scope::Note {
                workspace_id,
                note_id,
            } => format!("note:{workspace_id}:{note_id}:users"),
            Scope::Agenda { workspace_id } => format!("task:{workspace_id}:agenda_users"),
        }
    }
}

pub fn note_content_key(workspace_id: &str, note_id: &str) -> String {
    format!("note:{workspace_id}:{note_id}:content")
}

pub fn chat_messages_key(workspace_id: &str) -> String {
    format!("chat:{workspace_id}:messages")
}

pub fn chat_typing_key(workspace_id: &str) -> String {
    format!("chat:{workspace_id}:typing")
}

/// Pattern matching every collection presence key of one workspace.
pub fn collection_scan_pattern(workspace_id: &str) -> String {
    format!("collection:{workspace_id}:*:users")
}

/// Recover the collection id from a key produced by
/// [`Scope::Collection::store_key`].
pub fn collection_id_from_key(workspace_id: &str, key: &str) -> Option<String> {
    let prefix = format!("collection:{workspace_id}:");
    let rest = key.strip_prefix(&prefix)?;
    let collection_id = rest.strip_suffix(":users")?;
    (!collection_id.is_empty()).then(|| collection_id.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_follow_the_wire_contract() {
        assert_eq!(Scope::workspace("ws1").room_name(), "ws1");
        assert_eq!(Scope::collection("ws1", "c2").room_name(), "ws1:c2");
        assert_eq!(Scope::note("ws1", "n3").room_name(), "note:ws1:n3");
        assert_eq!(Scope::agenda("ws1").room_name(), "agenda:ws1");
    }

    #[test]
    fn store_keys_follow_the_shared_layout() {
        assert_eq!(Scope::workspace("ws1").store_key(), "workspace:ws1:users");
        assert_eq!(
            Scope::collection("ws1", "c2").store_key(),
            "collection:ws1:c2:users"
        );
        assert_eq!(Scope::note("ws1", "n3").store_key(), "note:ws1:n3:users");
        assert_eq!(Scope::agenda("ws1").store_key(), "task:ws1:agenda_users");
        assert_eq!(note_content_key("ws1", "n3"), "note:ws1:n3:content");
        assert_eq!(chat_messages_key("ws1"), "chat:ws1:messages");
        assert_eq!(chat_typing_key("ws1"), "chat:ws1:typing");
    }

    #[test]
    fn collection_ids_round_trip_through_keys() {
        let key = Scope::collection("ws1", "c2").store_key();
        assert_eq!(
            collection_id_from_key("ws1", &key),
            Some("c2".to_string())
        );
        assert_eq!(collection_id_from_key("ws1", "collection:ws1::users"), None);
        assert_eq!(collection_id_from_key("other", &key), None);
    }
}
