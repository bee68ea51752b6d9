//! Contact resolver backed by the `[[contacts]]` table from the config file.

use std::collections::HashMap;

use peerlink_core::{ContactInfo, ContactResolver, PeerId};
use tracing::debug;

use crate::reactor::{EventSender, ReactorEvent};

pub struct StaticResolver {
    contacts: HashMap<PeerId, ContactInfo>,
    events: EventSender,
}

impl StaticResolver {
    pub fn new(contacts: HashMap<PeerId, ContactInfo>, events: EventSender) -> Self {
        Self { contacts, events }
    }
}

impl ContactResolver for StaticResolver {
    fn get_contact(&self, peer: &PeerId) -> Option<ContactInfo> {
        self.contacts.get(peer).cloned()
    }

    /// The table never changes, so a lookup answers at once; the reply still goes
    /// through the reactor so the dispatcher sees the same flow as a network fetch.
    fn resolve_async(&mut self, peer: &PeerId) {
        let contact = self.contacts.get(peer).cloned();
        debug!("resolved {}: {}", peer, if contact.is_some() { "found" } else { "unknown" });
        let _ = self.events.send(ReactorEvent::ContactResolved {
            peer: peer.clone(),
            contact,
        });
    }

    fn peer_for_address(&self, protocol: &str, host: &str) -> Option<PeerId> {
        self.contacts
            .iter()
            .find(|(_, info)| {
                info.methods
                    .iter()
                    .any(|m| m.protocol == protocol && m.host == host)
            })
            .map(|(peer, _)| peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::ContactMethod;
    use tokio::sync::mpsc;

    fn resolver() -> (StaticResolver, mpsc::UnboundedReceiver<ReactorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let contacts = HashMap::from([(
            PeerId::from("a"),
            ContactInfo::new(vec![
                ContactMethod::new("tcp", "10.0.0.2", 7771),
                ContactMethod::new("udp", "10.0.0.3", 8882),
            ]),
        )]);
        (StaticResolver::new(contacts, tx), rx)
    }

    #[test]
    fn lookups() {
        let (r, _rx) = resolver();
        assert_eq!(r.get_contact(&PeerId::from("a")).unwrap().methods.len(), 2);
        assert!(r.get_contact(&PeerId::from("b")).is_none());
        assert_eq!(r.peer_for_address("udp", "10.0.0.3"), Some(PeerId::from("a")));
        assert!(r.peer_for_address("tcp", "10.0.0.3").is_none());
    }

    #[test]
    fn resolve_posts_result() {
        let (mut r, mut rx) = resolver();
        r.resolve_async(&PeerId::from("b"));
        match rx.try_recv().unwrap() {
            ReactorEvent::ContactResolved { peer, contact } => {
                assert_eq!(peer, PeerId::from("b"));
                assert!(contact.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
