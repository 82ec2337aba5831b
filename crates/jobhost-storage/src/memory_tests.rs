//! Tests for the in-memory storage account.

use super::*;
use tokio_test::{assert_err, assert_ok};

fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

async fn created_queue(account: &InMemoryStorageAccount, name: &str) -> InMemoryQueue {
    let queue = account.in_memory_queue(&queue_name(name));
    queue.create_if_not_exists().await.unwrap();
    queue
}

// ============================================================================
// Queue Tests
// ============================================================================

mod queues {
    use super::*;

    /// Verify that operations on a missing queue report queue-not-found.
    #[tokio::test]
    async fn test_missing_queue_reports_not_found() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = account.in_memory_queue(&queue_name("orders"));

        assert!(!queue.exists().await.unwrap());
        let error = queue
            .get_messages(1, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::QueueNotFound { .. }));
        assert!(error.is_transient_fetch_failure());
    }

    /// Verify that create reports whether it created the queue.
    #[tokio::test]
    async fn test_create_if_not_exists() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = account.in_memory_queue(&queue_name("orders"));

        assert!(queue.create_if_not_exists().await.unwrap());
        assert!(!queue.create_if_not_exists().await.unwrap());
        assert!(queue.exists().await.unwrap());
    }

    /// Verify that fetching hides messages and increments the dequeue count.
    #[tokio::test(start_paused = true)]
    async fn test_fetch_hides_message_until_timeout() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        queue.add_message(QueueMessage::new("a")).await.unwrap();

        let batch = queue.get_messages(16, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].dequeue_count, 1);
        assert!(batch[0].pop_receipt.is_some());

        assert!(queue
            .get_messages(16, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;

        let again = queue.get_messages(16, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].dequeue_count, 2);
        assert_ne!(again[0].pop_receipt, batch[0].pop_receipt);
    }

    /// Verify that batches respect the requested maximum and insertion order.
    #[tokio::test]
    async fn test_fetch_respects_batch_size() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        for i in 0..5 {
            queue
                .add_message(QueueMessage::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let batch = queue.get_messages(2, Duration::from_secs(30)).await.unwrap();
        let bodies: Vec<String> = batch.iter().map(|m| m.body_as_string()).collect();
        assert_eq!(bodies, vec!["m0", "m1"]);

        assert_err!(queue.get_messages(0, Duration::from_secs(1)).await);
        assert_err!(queue.get_messages(33, Duration::from_secs(1)).await);
    }

    /// Verify that a visibility update issues a new receipt and invalidates the old one.
    #[tokio::test]
    async fn test_update_visibility_rotates_receipt() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        queue.add_message(QueueMessage::new("a")).await.unwrap();
        let fetched = queue
            .get_messages(1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);

        let updated = queue
            .update_message_visibility(&fetched, Duration::from_secs(60))
            .await
            .unwrap();
        assert_ne!(updated.pop_receipt, fetched.pop_receipt);

        let stale = queue.delete_message(&fetched).await.unwrap_err();
        assert!(matches!(stale, StorageError::PopReceiptMismatch { .. }));
        assert!(stale.is_benign_race());

        queue.delete_message(&updated).await.unwrap();
        assert!(account.peek_all(&queue_name("orders")).is_empty());
    }

    /// Verify that a zero visibility timeout releases the message immediately.
    #[tokio::test]
    async fn test_zero_visibility_releases_message() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        queue.add_message(QueueMessage::new("a")).await.unwrap();
        let fetched = queue
            .get_messages(1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(account.visible_count(&queue_name("orders")), 0);

        queue
            .update_message_visibility(&fetched, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(account.visible_count(&queue_name("orders")), 1);
    }

    /// Verify that deleting an unknown message reports message-not-found.
    #[tokio::test]
    async fn test_delete_unknown_message() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        let mut ghost = QueueMessage::new("ghost");
        ghost.pop_receipt = Some(PopReceipt::new());

        let error = queue.delete_message(&ghost).await.unwrap_err();
        assert!(matches!(error, StorageError::MessageNotFound { .. }));
    }

    /// Verify that the causality id survives a round trip through the queue.
    #[tokio::test]
    async fn test_causality_id_is_stored() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        let parent = Uuid::new_v4();

        queue
            .add_message(QueueMessage::new("a").with_causality_id(parent))
            .await
            .unwrap();
        let fetched = queue.get_messages(1, Duration::from_secs(1)).await.unwrap();

        assert_eq!(fetched[0].causality_id, Some(parent));
        assert_eq!(queue.approximate_message_count().await.unwrap(), 1);
    }
}

// ============================================================================
// Fault Injection Tests
// ============================================================================

mod faults {
    use super::*;

    /// Verify that injected faults are returned once, in order.
    #[tokio::test]
    async fn test_faults_are_one_shot() {
        let account = InMemoryStorageAccount::new("Storage");
        let queue = created_queue(&account, "orders").await;
        account.inject_fault(
            FaultPoint::GetMessages,
            StorageError::ServerError {
                status: 503,
                message: "busy".to_string(),
            },
        );
        account.inject_fault(FaultPoint::GetMessages, StorageError::Timeout);

        let first = queue.get_messages(1, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(first.status_code(), 503);
        let second = queue.get_messages(1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(second, StorageError::Timeout));
        assert_ok!(queue.get_messages(1, Duration::from_secs(1)).await);
    }

    /// Verify that repeated faults are consumed one per call.
    #[tokio::test]
    async fn test_repeated_faults() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = account.in_memory_lease_store("hosts", "locks");
        account.inject_faults(FaultPoint::AcquireLease, StorageError::Timeout, 2);

        assert!(store.acquire_lease("a", Duration::from_secs(15), None).await.is_err());
        assert!(store.acquire_lease("a", Duration::from_secs(15), None).await.is_err());
        // Third call reaches the store and finds no container.
        let error = store
            .acquire_lease("a", Duration::from_secs(15), None)
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::ContainerNotFound { .. }));
    }
}

// ============================================================================
// Lease Tests
// ============================================================================

mod leases {
    use super::*;

    async fn store_with_blob(account: &InMemoryStorageAccount) -> InMemoryLeaseStore {
        let store = account.in_memory_lease_store("hosts", "locks");
        store.create_container_if_not_exists().await.unwrap();
        store.create_blob("lock-a").await.unwrap();
        store
    }

    /// Verify that acquiring a lease on a missing blob is a 404.
    #[tokio::test]
    async fn test_acquire_missing_blob() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = account.in_memory_lease_store("hosts", "locks");
        store.create_container_if_not_exists().await.unwrap();

        let error = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    /// Verify that a second acquirer gets a 409 while the lease is active.
    #[tokio::test]
    async fn test_second_acquire_conflicts() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;

        store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();
        let error = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap_err();

        assert!(error.is_conflict());
        assert!(error.is_lease_conflict());
    }

    /// Verify that re-acquiring with the active lease id succeeds.
    #[tokio::test]
    async fn test_acquire_with_same_id_succeeds() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let id = LeaseId::from_proposed("owner-1");

        let first = store
            .acquire_lease("lock-a", Duration::from_secs(15), Some(id.clone()))
            .await
            .unwrap();
        let second = store
            .acquire_lease("lock-a", Duration::from_secs(15), Some(id.clone()))
            .await
            .unwrap();

        assert_eq!(first, id);
        assert_eq!(second, id);
    }

    /// Verify that an expired lease can be taken by someone else, after which
    /// the original holder can no longer renew.
    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let first = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        let props = store.fetch_properties("lock-a").await.unwrap();
        assert_eq!(props.lease_state, LeaseState::Expired);

        let second = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();
        assert_ne!(first, second);

        let error = store.renew_lease("lock-a", &first).await.unwrap_err();
        assert!(matches!(error, StorageError::LeaseIdMismatch { .. }));
    }

    /// Verify that renewal extends an active lease by its period.
    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let id = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        store.renew_lease("lock-a", &id).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let props = store.fetch_properties("lock-a").await.unwrap();
        assert!(props.is_leased());
    }

    /// Verify that release frees the blob and rejects foreign lease ids.
    #[tokio::test]
    async fn test_release() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let id = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();

        let foreign = store
            .release_lease("lock-a", &LeaseId::new())
            .await
            .unwrap_err();
        assert!(foreign.is_conflict());

        store.release_lease("lock-a", &id).await.unwrap();
        let props = store.fetch_properties("lock-a").await.unwrap();
        assert_eq!(props.lease_state, LeaseState::Available);
        assert_eq!(props.lease_status, LeaseStatus::Unlocked);
    }

    /// Verify that metadata requires the active lease and is visible afterwards.
    #[tokio::test]
    async fn test_set_metadata_under_lease() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let id = store
            .acquire_lease("lock-a", Duration::from_secs(15), None)
            .await
            .unwrap();
        let metadata = HashMap::from([("FunctionInstance".to_string(), "abc".to_string())]);

        assert!(store
            .set_metadata("lock-a", &LeaseId::new(), metadata.clone())
            .await
            .is_err());
        store.set_metadata("lock-a", &id, metadata).await.unwrap();

        let props = store.fetch_properties("lock-a").await.unwrap();
        assert_eq!(props.metadata.get("FunctionInstance").unwrap(), "abc");
    }

    /// Verify that creating a blob twice conflicts and that a missing
    /// container is reported.
    #[tokio::test]
    async fn test_create_blob() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = account.in_memory_lease_store("hosts", "locks");

        let missing = store.create_blob("lock-a").await.unwrap_err();
        assert!(matches!(missing, StorageError::ContainerNotFound { .. }));

        store.create_container_if_not_exists().await.unwrap();
        store.create_blob("lock-a").await.unwrap();
        assert!(store.create_blob("lock-a").await.unwrap_err().is_conflict());
    }

    /// Verify that breaking a lease frees the blob for other acquirers.
    #[tokio::test]
    async fn test_break_lease() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = store_with_blob(&account).await;
        let id = store
            .acquire_lease("lock-a", Duration::from_secs(60), None)
            .await
            .unwrap();

        assert!(account.break_lease("hosts", "locks/lock-a"));

        assert!(store.renew_lease("lock-a", &id).await.is_err());
        assert_ok!(
            store
                .acquire_lease("lock-a", Duration::from_secs(15), None)
                .await
        );
    }
}

// ============================================================================
// Blob Container Tests
// ============================================================================

mod blobs {
    use super::*;

    async fn container(account: &InMemoryStorageAccount) -> InMemoryBlobContainer {
        let container = account.in_memory_container("images");
        assert!(container.create_if_not_exists().await.unwrap());
        container
    }

    /// Verify that listing pages through blobs in name order.
    #[tokio::test]
    async fn test_list_pages_in_name_order() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = container(&account).await;
        for name in ["c.png", "a.png", "b.png"] {
            container
                .upload_blob(name, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let first = container.list_blobs(2, None).await.unwrap();
        let names: Vec<&str> = first.items.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(first.continuation.as_deref(), Some("b.png"));

        let second = container
            .list_blobs(2, first.continuation.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].name, "c.png");
        assert_eq!(second.items[0].path(), "images/c.png");
        assert!(second.continuation.is_none());
    }

    /// Verify that every write gets a strictly later modification time.
    #[tokio::test]
    async fn test_writes_advance_last_modified() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = container(&account).await;

        let first = container
            .upload_blob("a.png", Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = container
            .upload_blob("b.png", Bytes::from_static(b"two"))
            .await
            .unwrap();
        let rewritten = container
            .upload_blob("a.png", Bytes::from_static(b"three"))
            .await
            .unwrap();

        assert!(second.last_modified > first.last_modified);
        assert!(rewritten.last_modified > second.last_modified);
        assert_eq!(rewritten.content_length, 5);
        assert_eq!(
            container.download_blob("a.png").await.unwrap(),
            Bytes::from_static(b"three")
        );
    }

    /// Verify that a missing container is reported as not found.
    #[tokio::test]
    async fn test_missing_container() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = account.in_memory_container("images");

        let error = assert_err!(container.list_blobs(10, None).await);
        assert!(error.is_not_found());
        let error = assert_err!(container.upload_blob("a", Bytes::new()).await);
        assert!(error.is_not_found());
        assert!(assert_err!(container.download_blob("a").await).is_not_found());
    }

    /// Verify that a leased blob cannot be overwritten.
    #[tokio::test]
    async fn test_leased_blob_rejects_upload() {
        let account = InMemoryStorageAccount::new("Storage");
        let store = account.in_memory_lease_store("images", "");
        store.create_container_if_not_exists().await.unwrap();
        store.create_blob("a.png").await.unwrap();
        store
            .acquire_lease("a.png", Duration::from_secs(15), None)
            .await
            .unwrap();

        let container = account.in_memory_container("images");
        let error = assert_err!(container.upload_blob("a.png", Bytes::new()).await);
        assert!(matches!(error, StorageError::LeaseIdMissing { .. }));
        assert_eq!(assert_ok!(container.list_blobs(10, None).await).items.len(), 1);
    }

    /// Verify that injected listing faults are returned once.
    #[tokio::test]
    async fn test_list_fault() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = container(&account).await;
        account.inject_fault(
            FaultPoint::ListBlobs,
            StorageError::ServerError {
                status: 503,
                message: "busy".to_string(),
            },
        );

        assert!(assert_err!(container.list_blobs(10, None).await).is_server_side());
        assert_ok!(container.list_blobs(10, None).await);
    }

    /// Verify that a zero page size is rejected.
    #[tokio::test]
    async fn test_zero_page_size() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = container(&account).await;

        let error = assert_err!(container.list_blobs(0, None).await);
        assert!(matches!(error, StorageError::Validation(_)));
    }

    /// Verify that deleted blobs drop out of listings.
    #[tokio::test]
    async fn test_delete_blob() {
        let account = InMemoryStorageAccount::new("Storage");
        let container = container(&account).await;
        container.upload_blob("a.png", Bytes::new()).await.unwrap();

        assert!(account.delete_blob("images", "a.png"));
        assert!(!account.delete_blob("images", "a.png"));
        assert!(container.list_blobs(10, None).await.unwrap().items.is_empty());
    }
}

// ============================================================================
// Account Provider Tests
// ============================================================================

mod provider {
    use super::*;

    /// Verify that accounts resolve by name and unknown names are reported.
    #[tokio::test]
    async fn test_get_account() {
        let provider = InMemoryAccountProvider::new()
            .with_account(InMemoryStorageAccount::new("Storage"))
            .with_account(InMemoryStorageAccount::new("Secondary"));

        assert_eq!(provider.get_account("Secondary").await.unwrap().name(), "Secondary");
        let error = provider.get_account("Missing").await.err().unwrap();
        assert!(matches!(error, StorageError::AccountNotFound { .. }));
    }

    /// Verify that handles from the same account share state.
    #[tokio::test]
    async fn test_handles_share_state() {
        let account = InMemoryStorageAccount::new("Storage");
        let provider = InMemoryAccountProvider::new().with_account(account.clone());
        let resolved = provider.get_account("Storage").await.unwrap();

        let name = queue_name("orders");
        resolved.queue(&name).create_if_not_exists().await.unwrap();

        assert!(account.queue_exists(&name));
    }
}
