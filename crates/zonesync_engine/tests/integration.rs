//! Integration tests for the sync engine against the in-process server.

use proptest::prelude::*;
use std::sync::Arc;
use zonesync_engine::{
    AdapterProvider, EntityState, KeyValueStore, LocalObject, ModelAdapter, SyncEngine, SyncEvent,
    SyncMode, DEVICE_ID_FIELD,
};
use zonesync_protocol::{FieldValue, RecordId, ZoneId};
use zonesync_testkit::prelude::*;

fn notes() -> ZoneId {
    ZoneId::new("notes")
}

fn note_id(name: &str) -> RecordId {
    RecordId::new(notes(), name)
}

#[tokio::test]
async fn new_object_round_trip() {
    init_tracing();
    let remote = ServerRemote::default();
    let device = TestDevice::new("a", remote.clone());
    let zone = device.add_zone(&notes());

    zone.insert("Note.1", "Note", &[("title", "groceries")]);
    assert_eq!(
        zone.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::New
    );

    let result = device.sync().await;
    assert_eq!(result.uploaded, 1);
    // Finalizing re-reads the zone; this device's own record is not imported.
    assert_eq!(result.downloaded, 0);

    let tracking = zone.adapter.tracking_record("Note.1").unwrap();
    assert_eq!(tracking.state, EntityState::Synced);
    assert!(tracking.encoded_record.is_some());

    let stored = remote.server().record(&note_id("Note.1")).unwrap();
    assert_eq!(stored.field("title"), Some(&FieldValue::from("groceries")));
    assert_eq!(
        stored.field(DEVICE_ID_FIELD).and_then(|v| v.as_text()),
        Some(device.engine.device_id().unwrap().as_str())
    );
    assert!(zone.adapter.server_change_token().unwrap().is_some());

    // Nothing left to do.
    remote.reset_counters();
    let second = device.sync().await;
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(remote.calls(RemoteOperation::PushRecords), 0);
    assert_eq!(remote.calls(RemoteOperation::CreateZone), 0);
}

#[tokio::test]
async fn two_devices_converge() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let b = TestDevice::new("b", remote.another_device());
    let a_notes = a.add_zone(&notes());
    let b_notes = b.add_zone(&notes());

    a_notes.insert("Note.1", "Note", &[("title", "one"), ("body", "first")]);
    a.sync().await;

    let pulled = b.sync().await;
    assert_eq!(pulled.downloaded, 1);
    let copy = b_notes.object("Note.1").unwrap();
    assert_eq!(copy.field("title"), Some(&FieldValue::from("one")));
    assert!(copy.field(DEVICE_ID_FIELD).is_none());
    assert_eq!(
        b_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Synced
    );

    b_notes.set_text("Note.1", "title", "edited on b");
    let pushed = b.sync().await;
    assert_eq!(pushed.uploaded, 1);

    let back = a.sync().await;
    assert_eq!(back.downloaded, 1);
    assert_eq!(a_notes.text("Note.1", "title").as_deref(), Some("edited on b"));
    // Only the changed key travelled; the server kept the rest.
    assert_eq!(a_notes.text("Note.1", "body").as_deref(), Some("first"));
}

#[tokio::test]
async fn deletions_propagate() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let b = TestDevice::new("b", remote.another_device());
    let a_notes = a.add_zone(&notes());
    let b_notes = b.add_zone(&notes());

    a_notes.insert("Note.1", "Note", &[("title", "doomed")]);
    a_notes.insert("Note.2", "Note", &[("title", "kept")]);
    a.sync().await;
    b.sync().await;
    assert!(b_notes.object("Note.1").is_some());

    a_notes.adapter.delete_object("Note.1").unwrap();
    assert_eq!(
        a_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Deleted
    );
    let result = a.sync().await;
    assert_eq!(result.deleted, 1);
    assert!(a_notes.adapter.tracking_record("Note.1").is_none());
    assert_eq!(remote.server().record_count(&notes()), 1);

    let result = b.sync().await;
    assert_eq!(result.remote_deletions, 1);
    assert!(b_notes.object("Note.1").is_none());
    assert!(b_notes.adapter.tracking_record("Note.1").is_none());
    assert!(b_notes.object("Note.2").is_some());
}

#[tokio::test]
async fn deletion_of_unknown_record_is_a_no_op() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let a_notes = a.add_zone(&notes());
    a_notes.insert("Note.1", "Note", &[("title", "short lived")]);
    a.sync().await;
    a_notes.adapter.delete_object("Note.1").unwrap();
    a.sync().await;

    // A device joining later reads the tombstone of a record it never saw.
    let c = TestDevice::new("c", remote.another_device());
    let c_notes = c.add_zone(&notes());
    let result = c.sync().await;
    assert_eq!(result.downloaded, 0);
    assert!(c_notes.adapter.tracking_records().is_empty());
    assert!(c_notes.objects.is_empty());
}

#[tokio::test]
async fn never_uploaded_object_deleted_locally_is_forgotten() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.clone());
    let a_notes = a.add_zone(&notes());

    a_notes.insert("Note.1", "Note", &[("title", "draft")]);
    a_notes.adapter.delete_object("Note.1").unwrap();
    assert!(a_notes.adapter.tracking_record("Note.1").is_none());

    a.sync().await;
    assert_eq!(remote.calls(RemoteOperation::PushDeletions), 0);
    assert_eq!(remote.server().record_count(&notes()), 0);
}

#[tokio::test]
async fn relationship_arriving_before_target_converges() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let a_notes = a.add_zone(&notes());

    // The note is pushed, and therefore fetched, before its folder.
    a_notes.insert_object(
        LocalObject::new("Note.1", "Note")
            .with_field("title", "inside")
            .with_field("folder", FieldValue::Reference("Folder.1".into())),
    );
    a_notes.insert("Folder.1", "Folder", &[("name", "inbox")]);
    a.sync().await;

    let b = TestDevice::with_config(
        test_config("b").with_fetch_page_size(1),
        remote.another_device(),
    );
    let b_notes = b.add_zone(&notes());
    let result = b.sync().await;
    assert_eq!(result.downloaded, 2);

    let note = b_notes.object("Note.1").unwrap();
    assert_eq!(
        note.field("folder"),
        Some(&FieldValue::Reference("Folder.1".into()))
    );
    assert!(b_notes.adapter.pending_relationships().is_empty());
    assert_eq!(
        b_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Synced
    );
}

#[tokio::test]
async fn relationship_arriving_after_target_links_immediately() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let a_notes = a.add_zone(&notes());
    a_notes.insert("Folder.1", "Folder", &[("name", "inbox")]);
    a_notes.insert_object(
        LocalObject::new("Note.1", "Note").with_field("folder", FieldValue::Reference("Folder.1".into())),
    );
    a.sync().await;

    let b = TestDevice::with_config(
        test_config("b").with_fetch_page_size(1),
        remote.another_device(),
    );
    let b_notes = b.add_zone(&notes());
    b.sync().await;

    assert_eq!(
        b_notes.object("Note.1").unwrap().field("folder"),
        Some(&FieldValue::Reference("Folder.1".into()))
    );
    assert!(b_notes.adapter.pending_relationships().is_empty());
}

#[tokio::test]
async fn pending_relationship_survives_across_cycles() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let b = TestDevice::new("b", remote.another_device());
    let a_notes = a.add_zone(&notes());
    let b_notes = b.add_zone(&notes());

    a_notes.insert_object(
        LocalObject::new("Note.1", "Note").with_field("folder", FieldValue::Reference("Folder.9".into())),
    );
    a.sync().await;
    b.sync().await;

    assert_eq!(
        b_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Inserted
    );
    assert_eq!(b_notes.adapter.pending_relationships().len(), 1);
    assert!(b_notes.object("Note.1").unwrap().field("folder").is_none());

    a_notes.insert("Folder.9", "Folder", &[("name", "late")]);
    a.sync().await;
    b.sync().await;

    assert!(b_notes.adapter.pending_relationships().is_empty());
    assert_eq!(
        b_notes.object("Note.1").unwrap().field("folder"),
        Some(&FieldValue::Reference("Folder.9".into()))
    );
    assert_eq!(
        b_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Synced
    );
}

#[tokio::test]
async fn download_only_never_uploads() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    a.add_zone(&notes()).insert("Note.1", "Note", &[("title", "remote")]);
    a.sync().await;

    let reader_remote = remote.another_device();
    let reader = TestDevice::with_config(
        test_config("reader").with_sync_mode(SyncMode::DownloadOnly),
        reader_remote.clone(),
    );
    let reader_notes = reader.add_zone(&notes());
    reader_notes.insert("Note.2", "Note", &[("title", "local only")]);

    let result = reader.sync().await;
    assert_eq!(result.downloaded, 1);
    assert_eq!(result.uploaded, 0);
    assert_eq!(reader_remote.calls(RemoteOperation::PushRecords), 0);
    assert_eq!(remote.server().record_count(&notes()), 1);
    assert_eq!(
        reader_notes.adapter.tracking_record("Note.2").unwrap().state,
        EntityState::New
    );
}

#[tokio::test]
async fn provider_supplies_adapters_for_new_zones() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    a.add_zone(&notes()).insert("Note.1", "Note", &[("title", "hello")]);
    let todos = ZoneId::new("todos");
    a.add_zone(&todos).insert("Todo.1", "Todo", &[("title", "ignored")]);
    a.sync().await;

    let b = TestDevice::new("b", remote.another_device());
    let provider = Arc::new(MemoryProvider::new(
        b.kv.clone() as Arc<dyn KeyValueStore>,
        "b",
    ));
    provider.refuse(&todos);
    b.engine
        .set_provider(Some(provider.clone() as Arc<dyn AdapterProvider>));
    let mut events = b.engine.subscribe();

    let result = b.sync().await;
    assert_eq!(result.downloaded, 1);
    assert_eq!(b.engine.zones(), vec![notes()]);
    let fixture = provider.fixture(&notes()).unwrap();
    assert_eq!(fixture.text("Note.1", "title").as_deref(), Some("hello"));
    assert!(provider.fixture(&todos).is_none());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SyncEvent::AdapterAdded(notes())));
    assert_eq!(seen.last(), Some(&SyncEvent::DidSynchronize));
}

#[tokio::test]
async fn remote_zone_deletion_discards_adapter() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let a_notes = a.add_zone(&notes());
    a_notes.insert("Note.1", "Note", &[("title", "x")]);
    a.sync().await;

    let b = TestDevice::new("b", remote.another_device());
    let provider = Arc::new(MemoryProvider::new(
        b.kv.clone() as Arc<dyn KeyValueStore>,
        "b",
    ));
    b.engine
        .set_provider(Some(provider.clone() as Arc<dyn AdapterProvider>));
    b.sync().await;
    assert_eq!(b.engine.zones(), vec![notes()]);

    a.engine.delete_remote_zone(&notes()).await.unwrap();
    assert!(!remote.server().has_zone(&notes()));
    assert!(a_notes.adapter.tracking_records().is_empty());
    assert!(a_notes.adapter.server_change_token().unwrap().is_none());
    // Domain objects stay.
    assert!(a_notes.object("Note.1").is_some());

    let mut events = b.engine.subscribe();
    b.sync().await;
    assert!(b.engine.zones().is_empty());
    assert_eq!(provider.deleted_zones(), vec![notes()]);
    let fixture = provider.fixture(&notes()).unwrap();
    assert!(fixture.adapter.tracking_records().is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SyncEvent::ZoneDeleted(notes())));
}

#[tokio::test]
async fn erasing_metadata_downloads_everything_again() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let a_notes = a.add_zone(&notes());
    a_notes.insert("Note.1", "Note", &[("title", "one")]);
    a_notes.insert("Note.2", "Note", &[("title", "two")]);
    a.sync().await;
    let old_device = a.engine.device_id().unwrap();

    a.engine.erase_local_metadata().unwrap();
    assert!(a_notes.adapter.tracking_records().is_empty());
    assert!(a_notes.adapter.server_change_token().unwrap().is_none());
    assert_ne!(a.engine.device_id().unwrap(), old_device);

    // Records carry the old device identifier and are no longer echoes.
    let result = a.sync().await;
    assert_eq!(result.downloaded, 2);
    assert_eq!(result.uploaded, 0);
    assert_eq!(a_notes.adapter.tracking_records().len(), 2);
    assert!(a_notes
        .adapter
        .tracking_records()
        .iter()
        .all(|record| record.state == EntityState::Synced));
}

#[tokio::test]
async fn subscriptions_are_created_once_and_shared() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let b = TestDevice::new("b", remote.another_device());
    a.add_zone(&notes());
    b.add_zone(&notes());

    let first = a.engine.subscribe_for_changes(&notes()).await.unwrap();
    let again = a.engine.subscribe_for_changes(&notes()).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(remote.server().fetch_subscriptions().len(), 1);

    // Another device adopts the existing zone subscription.
    let adopted = b.engine.subscribe_for_changes(&notes()).await.unwrap();
    assert_eq!(adopted, first);

    let database = a.engine.subscribe_for_database_changes().await.unwrap();
    assert_ne!(database, first);
    assert_eq!(remote.server().fetch_subscriptions().len(), 2);

    a.engine.cancel_subscriptions().await.unwrap();
    assert!(remote.server().fetch_subscriptions().is_empty());
}

#[test]
fn engine_restart_keeps_tokens_and_device_identity() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    a.add_zone(&notes()).insert("Note.1", "Note", &[("title", "x")]);
    runtime.block_on(a.sync());
    let device_id = a.engine.device_id().unwrap();

    let restarted = SyncEngine::new(
        test_config("a"),
        remote.another_device(),
        a.kv.clone() as Arc<dyn KeyValueStore>,
    )
    .unwrap();
    assert_eq!(restarted.device_id().unwrap(), device_id);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn uploaded_objects_arrive_unchanged(objects in objects_strategy(12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let remote = ServerRemote::default();
        let a = TestDevice::new("a", remote.another_device());
        let b = TestDevice::new("b", remote.another_device());
        let a_notes = a.add_zone(&notes());
        let b_notes = b.add_zone(&notes());

        for object in &objects {
            a_notes.insert_object(object.clone());
        }
        runtime.block_on(a.sync());
        let result = runtime.block_on(b.sync());

        prop_assert_eq!(result.downloaded, objects.len() as u64);
        for object in &objects {
            let stored = b_notes.object(&object.identifier);
            prop_assert_eq!(stored.as_ref(), Some(object));
        }
    }
}

#[tokio::test]
async fn reset_database_token_rescans_zones() {
    let remote = ServerRemote::default();
    let device = TestDevice::new("a", remote.clone());
    device
        .add_zone(&notes())
        .insert("Note.1", "Note", &[("title", "x")]);
    device.sync().await;
    device.sync().await;

    remote.reset_counters();
    device.sync().await;
    assert_eq!(remote.calls(RemoteOperation::FetchZoneChanges), 0);

    device.engine.reset_database_token().unwrap();
    let result = device.sync().await;
    assert!(remote.calls(RemoteOperation::FetchZoneChanges) >= 1);
    assert_eq!(result.downloaded, 0);
}

#[tokio::test]
async fn edit_during_push_is_not_lost() {
    let remote = ServerRemote::default();
    let a = TestDevice::new("a", remote.another_device());
    let b = TestDevice::new("b", remote.another_device());
    let a_notes = a.add_zone(&notes());
    let b_notes = b.add_zone(&notes());

    a_notes.insert("Note.1", "Note", &[("title", "draft")]);
    let editor = a_notes.clone();
    a.remote()
        .before_next_push(move |_| editor.set_text("Note.1", "title", "final"));
    a.sync().await;

    let stored = remote.server().record(&note_id("Note.1")).unwrap();
    assert_eq!(stored.field("title"), Some(&FieldValue::from("final")));
    assert_eq!(
        a_notes.adapter.tracking_record("Note.1").unwrap().state,
        EntityState::Synced
    );

    b.sync().await;
    assert_eq!(b_notes.text("Note.1", "title").as_deref(), Some("final"));
}
