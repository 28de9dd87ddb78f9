use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(TenantId);
id_newtype!(ActorId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Staff,
    Student,
    Company,
}

/// An actor id is only unique within its kind; equality needs both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorKey {
    pub actor_id: ActorId,
    pub kind: ActorKind,
}

impl ActorKey {
    pub fn new(actor_id: ActorId, kind: ActorKind) -> Self {
        Self { actor_id, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: ActorId,
    pub kind: ActorKind,
    pub tenant_id: TenantId,
}

impl Actor {
    pub fn new(actor_id: ActorId, kind: ActorKind, tenant_id: TenantId) -> Self {
        Self {
            actor_id,
            kind,
            tenant_id,
        }
    }

    pub fn key(&self) -> ActorKey {
        ActorKey {
            actor_id: self.actor_id,
            kind: self.kind,
        }
    }
}
