use chrono::{DateTime, Utc};
use roomwire_core::{ConnectionId, UserId};
use serde::Serialize;

use crate::broker::RpcTable;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub is_master: bool,
    pub joined_at: DateTime<Utc>,
}

/// Members in join order plus the room's function table.
///
/// Whenever `members` is non-empty exactly one of them is master, and it is
/// the earliest surviving joiner.
#[derive(Debug)]
pub struct Room {
    pub name: String,
    members: Vec<Member>,
    pub rpc: RpcTable,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            rpc: RpcTable::new(),
        }
    }

    /// Append a member. Returns `true` if it became master.
    pub fn add_member(&mut self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let is_master = self.members.is_empty();
        self.members.push(Member {
            user_id,
            connection_id,
            is_master,
            joined_at: Utc::now(),
        });
        is_master
    }

    /// Remove the member on `connection_id`.
    ///
    /// Returns the removed member and, if it was master and others remain,
    /// the member promoted in its place.
    pub fn remove_member(&mut self, connection_id: &ConnectionId) -> Option<(Member, Option<Member>)> {
        let idx = self
            .members
            .iter()
            .position(|m| &m.connection_id == connection_id)?;
        let removed = self.members.remove(idx);

        let promoted = match self.members.first_mut() {
            Some(next) if removed.is_master => {
                next.is_master = true;
                Some(next.clone())
            }
            _ => None,
        };
        Some((removed, promoted))
    }

    pub fn member_by_connection(&self, connection_id: &ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| &m.connection_id == connection_id)
    }

    pub fn member_by_user(&self, user_id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.user_id == user_id)
    }

    pub fn master(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_master)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Connections of every member except `except`.
    pub fn others(&self, except: &ConnectionId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|m| &m.connection_id != except)
            .map(|m| m.connection_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
