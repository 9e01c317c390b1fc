use crate::core::Message;
use crate::mesh::MeshTransport;

/// Outcome of source selection for one file.
#[derive(Debug)]
pub(crate) enum Selection {
    /// The local copy already has the right content; fetch nothing.
    Local,
    /// Fetch from the peer that sent this Info ACK.
    Remote(Message),
    /// No single-file ACK matched; the caller has to recurse into globs or
    /// give up.
    Unusable,
}

/// Aggregates Info ACKs for one broadcast and picks the source peer.
pub(crate) struct InfoCollector {
    head: Option<String>,
    hash_enabled: bool,
    acks: Vec<Message>,
}

impl InfoCollector {
    pub fn new(head: Option<String>, hash_enabled: bool) -> Self {
        Self {
            head,
            hash_enabled,
            acks: Vec::new(),
        }
    }

    pub fn add(&mut self, msg: Message) {
        self.acks.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.acks
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Pick where to get `filename` from. Candidates are the non-glob ACKs
    /// whose filename equals the request; a matching content digest makes
    /// the local copy authoritative, the head node overrides distance, and
    /// distance ties break on peer name.
    pub fn select(
        &self,
        filename: &str,
        local_digest: Option<&str>,
        local_exists: bool,
        transport: &dyn MeshTransport,
    ) -> Selection {
        let candidates: Vec<&Message> = self
            .acks
            .iter()
            .filter(|m| m.glob.is_empty() && m.filename == filename)
            .collect();

        if self.hash_enabled && local_exists {
            if let Some(local) = local_digest {
                if candidates
                    .iter()
                    .any(|m| m.digest.as_deref() == Some(local))
                {
                    return Selection::Local;
                }
            }
        }

        if let Some(head) = &self.head {
            if let Some(m) = candidates.iter().find(|m| &m.from == head) {
                return Selection::Remote((*m).clone());
            }
        }

        match candidates
            .into_iter()
            .min_by_key(|m| (transport.distance_to(&m.from), m.from.clone()))
        {
            Some(m) => Selection::Remote(m.clone()),
            None => Selection::Unusable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Result;
    use std::collections::HashMap;

    struct StubMesh {
        distances: HashMap<String, u32>,
    }

    impl StubMesh {
        fn new(distances: &[(&str, u32)]) -> Self {
            Self {
                distances: distances
                    .iter()
                    .map(|(n, d)| (n.to_string(), *d))
                    .collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl MeshTransport for StubMesh {
        fn local_name(&self) -> &str {
            "local"
        }

        async fn broadcast(&self, _msg: Message) -> Result<usize> {
            Ok(0)
        }

        async fn send(&self, _peer: &str, _msg: Message) -> Result<()> {
            Ok(())
        }

        fn distance_to(&self, peer: &str) -> u32 {
            self.distances.get(peer).copied().unwrap_or(u32::MAX)
        }
    }

    fn ack(from: &str, filename: &str, parts: i64, digest: Option<&str>) -> Message {
        Message::info_ack(from, filename, parts, 0o644, digest.map(String::from), 1)
    }

    #[test]
    fn test_min_distance_wins() {
        let mesh = StubMesh::new(&[("near", 1), ("far", 4)]);
        let mut info = InfoCollector::new(None, false);
        info.add(ack("far", "f", 3, None));
        info.add(ack("near", "f", 3, None));

        match info.select("f", None, false, &mesh) {
            Selection::Remote(m) => assert_eq!(m.from, "near"),
            other => panic!("unexpected selection: {:?}", other),
        }
    }

    #[test]
    fn test_distance_tie_breaks_on_name() {
        let mesh = StubMesh::new(&[("zeta", 2), ("alpha", 2)]);
        let mut info = InfoCollector::new(None, false);
        info.add(ack("zeta", "f", 3, None));
        info.add(ack("alpha", "f", 3, None));

        match info.select("f", None, false, &mesh) {
            Selection::Remote(m) => assert_eq!(m.from, "alpha"),
            other => panic!("unexpected selection: {:?}", other),
        }
    }

    #[test]
    fn test_head_node_overrides_distance() {
        let mesh = StubMesh::new(&[("near", 1), ("head", 9)]);
        let mut info = InfoCollector::new(Some("head".to_string()), false);
        info.add(ack("near", "f", 3, None));
        info.add(ack("head", "f", 3, None));

        match info.select("f", None, false, &mesh) {
            Selection::Remote(m) => assert_eq!(m.from, "head"),
            other => panic!("unexpected selection: {:?}", other),
        }
    }

    #[test]
    fn test_matching_digest_keeps_local_copy() {
        let mesh = StubMesh::new(&[("peer", 1)]);
        let mut info = InfoCollector::new(None, true);
        info.add(ack("peer", "f", 3, Some("d1")));

        assert!(matches!(
            info.select("f", Some("d1"), true, &mesh),
            Selection::Local
        ));
        // different digest: the remote copy supersedes the local one
        assert!(matches!(
            info.select("f", Some("d2"), true, &mesh),
            Selection::Remote(_)
        ));
        // no local copy: digest equality is irrelevant
        assert!(matches!(
            info.select("f", Some("d1"), false, &mesh),
            Selection::Remote(_)
        ));
    }

    #[test]
    fn test_glob_acks_are_not_candidates() {
        let mesh = StubMesh::new(&[("peer", 1)]);
        let mut info = InfoCollector::new(None, false);
        info.add(Message::glob_ack(
            "peer",
            "dir/*",
            vec!["dir/a".to_string(), "dir/b".to_string()],
            1,
        ));

        assert!(matches!(
            info.select("dir/*", None, false, &mesh),
            Selection::Unusable
        ));
    }

    #[test]
    fn test_empty_file_ack_is_a_candidate() {
        let mesh = StubMesh::new(&[("peer", 1)]);
        let mut info = InfoCollector::new(None, false);
        info.add(ack("peer", "empty.txt", 0, None));

        match info.select("empty.txt", None, false, &mesh) {
            Selection::Remote(m) => assert_eq!(m.parts, 0),
            other => panic!("unexpected selection: {:?}", other),
        }
    }
}
