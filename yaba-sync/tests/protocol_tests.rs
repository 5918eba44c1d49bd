use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use uuid::Uuid;
use yaba_sync::protocol::codes;
use yaba_sync::{
    AcknowledgeMessage, DeleteLogMessage, ErrorMessage, HandshakeMessage, PROTOCOL_VERSION,
    SyncCompleteMessage, SyncEnvelope, SyncMessage,
};
use yaba_types::{EntityId, EntityKind, ReplicaId, Timestamp, Tombstone};

#[test]
fn request_has_no_correlation() {
    let envelope = SyncEnvelope::request(SyncMessage::DeleteLogExchange(DeleteLogMessage {
        tombstones: vec![],
    }));
    assert!(envelope.in_reply_to.is_none());
}

#[test]
fn reply_names_its_request() {
    let request = SyncEnvelope::request(SyncMessage::SyncComplete(SyncCompleteMessage {
        merged: None,
    }));
    let reply = SyncEnvelope::reply(
        request.id,
        SyncMessage::Acknowledge(AcknowledgeMessage::new(request.id)),
    );
    assert_eq!(reply.in_reply_to, Some(request.id));
    assert_ne!(reply.id, request.id);
}

#[test]
fn handshake_defaults() {
    let id = ReplicaId::new();
    let hello = HandshakeMessage::new(id, "Laptop");
    assert_eq!(hello.version, PROTOCOL_VERSION);
    assert_eq!(hello.device_id, id);
    assert_eq!(hello.device_name, "Laptop");
    assert!(hello.heads.is_empty());
}

#[test]
fn handshake_knows_replicas_in_its_heads() {
    let me = ReplicaId::new();
    let other = ReplicaId::new();
    let hello = HandshakeMessage::new(me, "Phone").with_heads(BTreeMap::from([(me, 4), (other, 2)]));
    assert!(hello.knows(other));
    assert!(!hello.knows(ReplicaId::new()));
}

#[test]
fn envelope_json_shape() {
    let request_id = Uuid::now_v7();
    let envelope = SyncEnvelope::reply(
        request_id,
        SyncMessage::Error(ErrorMessage::new(codes::FULL_SYNC_REQUIRED, "gap")),
    );
    let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(json["inReplyTo"], request_id.to_string());
    assert_eq!(json["message"]["Error"]["code"], codes::FULL_SYNC_REQUIRED);
    assert_eq!(json["message"]["Error"]["message"], "gap");
}

#[test]
fn envelope_survives_json() {
    let tombstone = Tombstone::new(EntityKind::Bookmark, EntityId::new(), Timestamp::from_millis(200));
    let envelope = SyncEnvelope::request(SyncMessage::DeleteLogExchange(DeleteLogMessage {
        tombstones: vec![tombstone],
    }));
    let json = serde_json::to_string(&envelope).unwrap();
    let decoded: SyncEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, envelope);
}

#[test]
fn missing_reply_field_decodes_as_request() {
    let id = Uuid::now_v7();
    let json = format!(r#"{{"id":"{id}","message":{{"Error":{{"code":400,"message":"bad"}}}}}}"#);
    let envelope: SyncEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(envelope.in_reply_to, None);
    assert_eq!(envelope.message.name(), "Error");
}

#[test]
fn message_names() {
    let ack = SyncMessage::Acknowledge(AcknowledgeMessage::new(Uuid::now_v7()));
    assert_eq!(ack.name(), "Acknowledge");
    let complete = SyncMessage::SyncComplete(SyncCompleteMessage { merged: None });
    assert_eq!(complete.name(), "SyncComplete");
}
