//! Router tests
//!
//! Drive routers directly through their parent-facing facade with recording
//! child facades standing in for peers.

#![allow(clippy::unwrap_used)]

use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;
use overlay_core::{
    ChildFacade, ChildLink, ConnectionId, ConnectionRecord, NetworkError, PEER_DISCONNECTED, Packet,
    ParentFacade, PeerId, Router, SequentialEnv,
};

/// Child facade that records every call.
#[derive(Default)]
struct MockFacade {
    accept: bool,
    opened: RefCell<Vec<ConnectionRecord>>,
    received: RefCell<Vec<Packet>>,
    closed: RefCell<Vec<(PeerId, ConnectionId, String)>>,
}

#[async_trait(?Send)]
impl ChildFacade for MockFacade {
    async fn open_connection(&self, connection: &ConnectionRecord) -> Result<bool, NetworkError> {
        self.opened.borrow_mut().push(connection.clone());
        Ok(self.accept)
    }

    async fn receive_packet(&self, packet: Packet) -> Result<(), NetworkError> {
        self.received.borrow_mut().push(packet);
        Ok(())
    }

    async fn close_connection(
        &self,
        target: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError> {
        self.closed.borrow_mut().push((target.clone(), connection.clone(), reason.to_string()));
        Ok(())
    }
}

struct MockPeer {
    id: PeerId,
    facade: Rc<MockFacade>,
    link: ChildLink,
    parent: Rc<dyn ParentFacade>,
}

impl MockPeer {
    async fn register(parent: Rc<dyn ParentFacade>, name: &str, accept: bool) -> Self {
        let facade = Rc::new(MockFacade { accept, ..Default::default() });
        let link = ChildLink::new(Rc::clone(&facade) as Rc<dyn ChildFacade>);
        let id = parent.register_peer(name, link.clone()).await.unwrap();
        Self { id, facade, link, parent }
    }

    async fn dispose(&self) {
        self.parent.disconnect(&self.link).await;
    }

    fn packet(&self, connection: &ConnectionRecord, target: &PeerId) -> Packet {
        Packet {
            source: self.id.clone(),
            target: target.clone(),
            connection: connection.id.clone(),
            data: Bytes::from_static(b"payload"),
        }
    }
}

/// Root with two leaves, the classic two-subtree layout.
fn two_leaves() -> (Router<SequentialEnv>, Router<SequentialEnv>, Router<SequentialEnv>) {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let leaf1 = Router::child(root.connect(), env.clone()).unwrap();
    let leaf2 = Router::child(root.connect(), env).unwrap();
    (root, leaf1, leaf2)
}

#[tokio::test]
async fn register_peer_directly() {
    let router = Router::root(SequentialEnv::new());
    let peer = MockPeer::register(router.connect(), "test", false).await;

    assert_eq!(router.peer_handle(&peer.id).map(|h| h.facade), Some(peer.link.clone()));
}

#[tokio::test]
async fn register_peer_all_the_way_to_root() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let mid = Router::child(root.connect(), env.clone()).unwrap();
    let leaf = Router::child(mid.connect(), env).unwrap();
    let peer = MockPeer::register(leaf.connect(), "test", false).await;

    assert_eq!(leaf.peer_handle(&peer.id).map(|h| h.facade), Some(peer.link.clone()));
    assert_eq!(mid.peer_handle(&peer.id).map(|h| h.facade), Some(leaf.link().clone()));
    assert_eq!(root.peer_handle(&peer.id).map(|h| h.facade), Some(mid.link().clone()));
}

#[tokio::test]
async fn root_assigns_ids_for_whole_tree() {
    let (root, leaf1, leaf2) = two_leaves();
    let a = MockPeer::register(leaf1.connect(), "a", false).await;
    let b = MockPeer::register(leaf2.connect(), "b", false).await;
    let c = MockPeer::register(root.connect(), "c", false).await;

    assert_ne!(a.id, b.id);
    assert_ne!(b.id, c.id);
    assert_eq!(root.peer_count(), 3);
    assert_eq!(leaf1.peer_count(), 1);
}

#[tokio::test]
async fn unregister_peer() {
    let router = Router::root(SequentialEnv::new());
    let peer = MockPeer::register(router.connect(), "test", false).await;

    peer.dispose().await;

    assert_eq!(router.peer_count(), 0);
}

#[tokio::test]
async fn remove_unknown_peer_is_noop() {
    let router = Router::root(SequentialEnv::new());
    let _peer = MockPeer::register(router.connect(), "test", false).await;

    router.connect().remove_peer(&"nobody".into()).await.unwrap();

    assert_eq!(router.peer_count(), 1);
}

#[tokio::test]
async fn unregister_peers_when_child_router_is_disposed() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let leaf = Router::child(root.connect(), env).unwrap();
    let _a = MockPeer::register(leaf.connect(), "a", false).await;
    let _b = MockPeer::register(leaf.connect(), "b", false).await;
    let other = MockPeer::register(root.connect(), "other", false).await;

    leaf.dispose().await;

    let remaining: Vec<PeerId> = root.local_peers().into_iter().map(|p| p.id).collect();
    assert_eq!(remaining, [other.id]);
}

#[tokio::test]
async fn disposing_intermediate_router_cascades_to_every_ancestor() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let mid = Router::child(root.connect(), env.clone()).unwrap();
    let leaf = Router::child(mid.connect(), env).unwrap();
    let a = MockPeer::register(leaf.connect(), "a", false).await;
    let b = MockPeer::register(leaf.connect(), "b", false).await;
    let c = MockPeer::register(mid.connect(), "c", false).await;

    leaf.dispose().await;

    assert!(mid.peer_handle(&a.id).is_none());
    assert!(mid.peer_handle(&b.id).is_none());
    assert!(root.peer_handle(&a.id).is_none());
    assert!(root.peer_handle(&b.id).is_none());
    assert!(root.peer_handle(&c.id).is_some());
    assert_eq!(leaf.peer_count(), 2);
}

#[tokio::test]
async fn disposed_router_refuses_new_requests() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let leaf = Router::child(root.connect(), env).unwrap();
    let a = MockPeer::register(leaf.connect(), "a", true).await;
    let b = MockPeer::register(leaf.connect(), "b", true).await;
    let record = leaf.connect().open_connection(&a.id, &b.id).await.unwrap();

    leaf.dispose().await;
    leaf.dispose().await;

    assert!(leaf.is_disposed());
    let facade = Rc::new(MockFacade::default());
    let late = leaf.connect().register_peer("late", ChildLink::new(facade as Rc<dyn ChildFacade>)).await;
    assert_eq!(late, Err(NetworkError::RouterDetached));
    assert_eq!(root.peer_count(), 0);

    let parent = leaf.connect();
    assert_eq!(parent.open_connection(&a.id, &b.id).await, Err(NetworkError::RouterDetached));
    assert_eq!(parent.send_packet(a.packet(&record, &b.id)).await, Err(NetworkError::RouterDetached));
    assert_eq!(
        parent.close_connection(&a.id, &record.id, "late").await,
        Err(NetworkError::RouterDetached)
    );
    assert_eq!(parent.find_peers_by_name("a").await, Err(NetworkError::RouterDetached));
    assert!(b.facade.received.borrow().is_empty());
    assert!(b.facade.closed.borrow().is_empty());
}

#[tokio::test]
async fn create_connection_at_lowest_common_router() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let router = Router::child(root.connect(), env).unwrap();
    let server = MockPeer::register(router.connect(), "server", true).await;
    let client = MockPeer::register(router.connect(), "client", false).await;

    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    assert_eq!(connection.client, client.id);
    assert_eq!(connection.server, server.id);
    assert_eq!(*server.facade.opened.borrow(), [connection.clone()]);
    assert_eq!(router.connection_record(&connection.id), Some(connection));
    assert_eq!(root.connection_count(), 0);
}

#[tokio::test]
async fn connection_across_leaves_lives_at_root_only() {
    let (root, leaf1, leaf2) = two_leaves();
    let server = MockPeer::register(leaf1.connect(), "server", true).await;
    let client = MockPeer::register(leaf2.connect(), "client", false).await;

    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    assert!(root.connection_record(&connection.id).is_some());
    assert_eq!(leaf1.connection_count(), 0);
    assert_eq!(leaf2.connection_count(), 0);
}

#[tokio::test]
async fn connection_between_sibling_leaves_lives_at_their_parent() {
    let env = SequentialEnv::new();
    let root = Router::root(env.clone());
    let mid = Router::child(root.connect(), env.clone()).unwrap();
    let left = Router::child(mid.connect(), env.clone()).unwrap();
    let right = Router::child(mid.connect(), env).unwrap();
    let server = MockPeer::register(left.connect(), "server", true).await;
    let client = MockPeer::register(right.connect(), "client", false).await;

    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    assert!(mid.connection_record(&connection.id).is_some());
    assert_eq!(root.connection_count(), 0);
    assert_eq!(left.connection_count(), 0);
    assert_eq!(right.connection_count(), 0);
}

#[tokio::test]
async fn open_connection_rejected_by_server() {
    let router = Router::root(SequentialEnv::new());
    let server = MockPeer::register(router.connect(), "server", false).await;
    let client = MockPeer::register(router.connect(), "client", false).await;

    let result = client.parent.open_connection(&client.id, &server.id).await;

    assert_eq!(result, Err(NetworkError::ConnectionRejected(server.id.clone())));
    assert_eq!(router.connection_count(), 0);
}

#[tokio::test]
async fn open_connection_to_unknown_peer() {
    let (_root, leaf1, _leaf2) = two_leaves();
    let client = MockPeer::register(leaf1.connect(), "client", false).await;

    let result = client.parent.open_connection(&client.id, &"ghost".into()).await;

    assert_eq!(result, Err(NetworkError::PeerNotFound("ghost".into())));
}

#[tokio::test]
async fn open_connection_for_foreign_client_is_denied() {
    let (_root, leaf1, leaf2) = two_leaves();
    let server = MockPeer::register(leaf1.connect(), "server", true).await;
    let stranger = MockPeer::register(leaf2.connect(), "stranger", false).await;

    // leaf1 never saw `stranger` register
    let result = leaf1.connect().open_connection(&stranger.id, &server.id).await;

    assert_eq!(result, Err(NetworkError::AccessDenied(stranger.id.clone())));
    assert!(server.facade.opened.borrow().is_empty());
}

#[tokio::test]
async fn send_packets_both_ways() {
    let (_root, leaf1, leaf2) = two_leaves();
    let server = MockPeer::register(leaf1.connect(), "server", true).await;
    let client = MockPeer::register(leaf2.connect(), "client", false).await;
    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    let packet = client.packet(&connection, &server.id);
    client.parent.send_packet(packet.clone()).await.unwrap();

    assert_eq!(*server.facade.received.borrow(), [packet]);
    assert!(client.facade.received.borrow().is_empty());

    server.facade.received.borrow_mut().clear();

    let packet = server.packet(&connection, &client.id);
    server.parent.send_packet(packet.clone()).await.unwrap();

    assert_eq!(*client.facade.received.borrow(), [packet]);
    assert!(server.facade.received.borrow().is_empty());
}

#[tokio::test]
async fn send_packet_with_mismatched_endpoints_is_invalid() {
    let router = Router::root(SequentialEnv::new());
    let server = MockPeer::register(router.connect(), "server", true).await;
    let client = MockPeer::register(router.connect(), "client", false).await;
    let bystander = MockPeer::register(router.connect(), "bystander", false).await;
    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    let result = client.parent.send_packet(client.packet(&connection, &bystander.id)).await;
    assert_eq!(result, Err(NetworkError::InvalidConnection(connection.id.clone())));

    let result = bystander.parent.send_packet(bystander.packet(&connection, &server.id)).await;
    assert_eq!(result, Err(NetworkError::InvalidConnection(connection.id.clone())));

    assert!(server.facade.received.borrow().is_empty());
    assert!(bystander.facade.received.borrow().is_empty());
}

#[tokio::test]
async fn send_packet_on_unknown_connection_is_invalid() {
    let (_root, leaf1, leaf2) = two_leaves();
    let client = MockPeer::register(leaf1.connect(), "client", false).await;
    let server = MockPeer::register(leaf2.connect(), "server", true).await;
    let fake = ConnectionRecord { id: "nope".into(), client: client.id.clone(), server: server.id.clone() };

    let result = client.parent.send_packet(client.packet(&fake, &server.id)).await;

    assert_eq!(result, Err(NetworkError::InvalidConnection("nope".into())));
}

#[tokio::test]
async fn send_packet_from_unregistered_source_is_denied() {
    let router = Router::root(SequentialEnv::new());
    let server = MockPeer::register(router.connect(), "server", true).await;
    let packet = Packet {
        source: "forged".into(),
        target: server.id.clone(),
        connection: "c".into(),
        data: Bytes::new(),
    };

    let result = router.connect().send_packet(packet).await;

    assert_eq!(result, Err(NetworkError::AccessDenied("forged".into())));
}

#[tokio::test]
async fn close_connection_from_either_side() {
    let (root, leaf1, leaf2) = two_leaves();
    let server = MockPeer::register(leaf1.connect(), "server", true).await;
    let client = MockPeer::register(leaf2.connect(), "client", false).await;

    {
        let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

        client.parent.close_connection(&client.id, &connection.id, "terminated").await.unwrap();

        assert_eq!(
            *server.facade.closed.borrow(),
            [(server.id.clone(), connection.id.clone(), "terminated".to_string())]
        );
        assert!(client.facade.closed.borrow().is_empty());
        assert_eq!(root.connection_count(), 0);
    }

    server.facade.closed.borrow_mut().clear();

    {
        let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

        server.parent.close_connection(&server.id, &connection.id, "terminated").await.unwrap();

        assert_eq!(
            *client.facade.closed.borrow(),
            [(client.id.clone(), connection.id.clone(), "terminated".to_string())]
        );
        assert!(server.facade.closed.borrow().is_empty());
        assert_eq!(root.connection_count(), 0);
    }
}

#[tokio::test]
async fn close_connection_by_non_endpoint_is_denied() {
    let router = Router::root(SequentialEnv::new());
    let server = MockPeer::register(router.connect(), "server", true).await;
    let client = MockPeer::register(router.connect(), "client", false).await;
    let bystander = MockPeer::register(router.connect(), "bystander", false).await;
    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    let result = bystander.parent.close_connection(&bystander.id, &connection.id, "hijack").await;

    assert_eq!(result, Err(NetworkError::AccessDenied(bystander.id.clone())));
    assert_eq!(router.connection_count(), 1);
}

#[tokio::test]
async fn closing_twice_is_quiet() {
    let router = Router::root(SequentialEnv::new());
    let server = MockPeer::register(router.connect(), "server", true).await;
    let client = MockPeer::register(router.connect(), "client", false).await;
    let connection = client.parent.open_connection(&client.id, &server.id).await.unwrap();

    client.parent.close_connection(&client.id, &connection.id, "once").await.unwrap();
    client.parent.close_connection(&client.id, &connection.id, "twice").await.unwrap();

    assert_eq!(server.facade.closed.borrow().len(), 1);
}

#[tokio::test]
async fn removing_peer_closes_its_connections() {
    let (root, leaf1, leaf2) = two_leaves();
    let server = MockPeer::register(leaf1.connect(), "server", true).await;
    let client = MockPeer::register(leaf2.connect(), "client", true).await;
    let neighbour = MockPeer::register(leaf1.connect(), "neighbour", true).await;

    let across = client.parent.open_connection(&client.id, &server.id).await.unwrap();
    let local = neighbour.parent.open_connection(&neighbour.id, &server.id).await.unwrap();

    server.dispose().await;

    assert_eq!(
        *client.facade.closed.borrow(),
        [(client.id.clone(), across.id.clone(), PEER_DISCONNECTED.to_string())]
    );
    assert_eq!(
        *neighbour.facade.closed.borrow(),
        [(neighbour.id.clone(), local.id.clone(), PEER_DISCONNECTED.to_string())]
    );
    assert!(server.facade.closed.borrow().is_empty());
    assert_eq!(root.connection_count(), 0);
    assert_eq!(leaf1.connection_count(), 0);
    assert!(root.peer_handle(&server.id).is_none());
}

#[tokio::test]
async fn get_peers_answers_from_root() {
    let (_root, leaf1, leaf2) = two_leaves();
    let a = MockPeer::register(leaf1.connect(), "a", false).await;
    let b = MockPeer::register(leaf2.connect(), "b", false).await;

    let peers = leaf1.connect().get_peers().await.unwrap();

    let ids: Vec<PeerId> = peers.iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids, [a.id, b.id]);
    assert_eq!(peers[1].name, "b");
}

#[tokio::test]
async fn find_peers_by_name_across_tree() {
    let (_root, leaf1, leaf2) = two_leaves();
    let a = MockPeer::register(leaf1.connect(), "echo", false).await;
    let _b = MockPeer::register(leaf2.connect(), "other", false).await;
    let c = MockPeer::register(leaf2.connect(), "echo", false).await;

    let found = leaf2.connect().find_peers_by_name("echo").await.unwrap();

    assert_eq!(found, [a.id, c.id]);
    assert!(leaf1.connect().find_peers_by_name("nobody").await.unwrap().is_empty());
}
