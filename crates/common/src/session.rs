use std::sync::OnceLock;

use uuid::Uuid;

use crate::accessor::AccessorContext;
use crate::keysafe::{CapabilityTable, UnlockCapability};
use crate::{Error, Result};

/// Who is acting in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    Member(Uuid),
    Anonymous,
}

/// One accessor's view of the system: who they are, what they have unlocked
/// and what has been decrypted for them so far.
///
/// Passed explicitly to every operation that needs it. Gateway requests get
/// a fresh anonymous session each.
#[derive(Debug, Default)]
pub struct Session {
    accessor: Option<Accessor>,
    remote_address: Option<String>,
    context: OnceLock<AccessorContext>,
    capabilities: CapabilityTable,
}

impl Session {
    pub fn member(id: Uuid) -> Self {
        Self {
            accessor: Some(Accessor::Member(id)),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self {
            accessor: Some(Accessor::Anonymous),
            ..Default::default()
        }
    }

    /// A session with no accessor; it has no context to cache into.
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn accessor(&self) -> Option<&Accessor> {
        self.accessor.as_ref()
    }

    pub fn member_id(&self) -> Option<Uuid> {
        match self.accessor {
            Some(Accessor::Member(id)) => Some(id),
            _ => None,
        }
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// The accessor's cache, created on first use.
    pub fn context(&self) -> Result<&AccessorContext> {
        if self.accessor.is_none() {
            return Err(Error::NoContext);
        }
        Ok(self.context.get_or_init(AccessorContext::new))
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// The capability for an unlocked KeySafe
    pub fn capability(&self, keysafe: Uuid) -> Result<UnlockCapability> {
        self.capabilities
            .get(keysafe)
            .ok_or(Error::LockedResource(keysafe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_has_no_context() {
        let session = Session::unbound();
        assert!(matches!(session.context(), Err(Error::NoContext)));
    }

    #[test]
    fn test_context_is_shared_within_session() {
        let session = Session::anonymous();
        let id = Uuid::new_v4();
        session.context().unwrap().retain(id, 3u16);

        assert_eq!(session.context().unwrap().retrieve::<u16>(id).unwrap(), Some(3));
    }

    #[test]
    fn test_locked_capability() {
        let member = Uuid::new_v4();
        let session = Session::member(member);
        let keysafe = Uuid::new_v4();

        assert_eq!(session.member_id(), Some(member));
        assert!(matches!(
            session.capability(keysafe),
            Err(Error::LockedResource(id)) if id == keysafe
        ));
    }
}
