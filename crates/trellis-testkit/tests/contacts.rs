//! Contact exchange and removal.

use std::sync::Arc;

use trellis::{AutoConfirm, DeviceConfig, DeviceError, Disposition, Rejection};
use trellis_testkit::Cluster;

#[tokio::test]
async fn test_contact_exchange_is_symmetric() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster.add_initialized("bob").await.unwrap();
    cluster.befriend("alice", "bob").await.unwrap();

    let alice_linked = cluster.linked("alice").await.unwrap();
    let bob_linked = cluster.linked("bob").await.unwrap();
    let alice = cluster.device("alice");
    let bob = cluster.device("bob");

    assert_eq!(alice.get_contacts().await.unwrap(), vec![bob_linked.clone()]);
    assert_eq!(bob.get_contacts().await.unwrap(), vec![alice_linked.clone()]);

    // Imported groups are flagged and resolve to the other side's devices
    let imported = alice
        .dispatcher()
        .groups()
        .get(&bob_linked)
        .await
        .unwrap()
        .unwrap();
    assert!(imported.contact_level);
    let resolved = alice.dispatcher().groups().resolve_one(&bob_linked).await.unwrap();
    assert!(resolved.contains(&bob.key()));
    assert!(!resolved.contains(&alice.key()));

    // Contacts are not linked devices
    assert_eq!(alice.get_linked_devices().await.unwrap().len(), 1);
    assert!(cluster.rejections("alice").is_empty());
    assert!(cluster.rejections("bob").is_empty());
}

#[tokio::test]
async fn test_import_reaches_linked_devices() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster.add("alice-phone").await;
    cluster.link("alice-phone", "alice").await.unwrap();
    cluster.add_initialized("bob").await.unwrap();
    cluster.add("bob-tablet").await;
    cluster.link("bob-tablet", "bob").await.unwrap();

    cluster.befriend("alice", "bob").await.unwrap();

    let alice_linked = cluster.linked("alice").await.unwrap();
    let bob_linked = cluster.linked("bob").await.unwrap();
    assert_eq!(
        cluster.device("alice-phone").get_contacts().await.unwrap(),
        vec![bob_linked.clone()]
    );
    assert_eq!(
        cluster.device("bob-tablet").get_contacts().await.unwrap(),
        vec![alice_linked.clone()]
    );

    let tablet = cluster.device("bob-tablet");
    let resolved = tablet.dispatcher().groups().resolve_one(&alice_linked).await.unwrap();
    assert!(resolved.contains(&cluster.device("alice").key()));
    assert!(resolved.contains(&cluster.device("alice-phone").key()));
}

#[tokio::test]
async fn test_own_devices_are_not_contacts() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster.add("alice-phone").await;
    cluster.link("alice-phone", "alice").await.unwrap();

    let alice = cluster.device("alice");
    let phone_key = cluster.device("alice-phone").key();
    assert!(matches!(
        alice.add_contact(phone_key).await,
        Err(DeviceError::Rejected(Rejection::SelfContactRejected))
    ));
    assert!(matches!(
        alice.add_contact(alice.key()).await,
        Err(DeviceError::Rejected(Rejection::SelfContactRejected))
    ));
}

#[tokio::test]
async fn test_declined_contact_request() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster
        .add_with("bob", Arc::new(AutoConfirm::reject()), DeviceConfig::default())
        .await;
    cluster.device("bob").create_device().await.unwrap();

    cluster.befriend("alice", "bob").await.unwrap();

    assert!(cluster.device("alice").get_contacts().await.unwrap().is_empty());
    assert!(cluster.device("bob").get_contacts().await.unwrap().is_empty());
    let rejected = cluster.rejections("bob");
    assert!(matches!(
        rejected.as_slice(),
        [d] if matches!(d.disposition, Disposition::Rejected(Rejection::PermissionDenied(_)))
    ));
}

#[tokio::test]
async fn test_repeated_request_is_idempotent() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster.add_initialized("bob").await.unwrap();
    cluster.befriend("alice", "bob").await.unwrap();
    cluster.befriend("alice", "bob").await.unwrap();
    cluster.befriend("bob", "alice").await.unwrap();

    assert_eq!(cluster.device("alice").get_contacts().await.unwrap().len(), 1);
    assert_eq!(cluster.device("bob").get_contacts().await.unwrap().len(), 1);
    assert!(cluster.rejections("alice").is_empty());
    assert!(cluster.rejections("bob").is_empty());
}

#[tokio::test]
async fn test_remove_contact_everywhere() {
    let mut cluster = Cluster::new();
    cluster.add_initialized("alice").await.unwrap();
    cluster.add("alice-phone").await;
    cluster.link("alice-phone", "alice").await.unwrap();
    cluster.add_initialized("bob").await.unwrap();
    cluster.befriend("alice", "bob").await.unwrap();

    let bob_linked = cluster.linked("bob").await.unwrap();
    let bob_key = cluster.device("bob").key();
    cluster
        .device("alice")
        .remove_contact(&bob_linked)
        .await
        .unwrap();
    cluster.settle().await.unwrap();

    for name in ["alice", "alice-phone"] {
        let device = cluster.device(name);
        assert!(device.get_contacts().await.unwrap().is_empty(), "{name}");
        let groups = device.dispatcher().groups();
        assert!(!groups.exists(&bob_linked).await.unwrap(), "{name}");
        let everything: Vec<_> = groups.all().await.unwrap();
        assert!(
            everything.iter().all(|g| g.device_key() != Some(bob_key)),
            "{name} still holds bob's leaf"
        );
    }

    assert!(matches!(
        cluster.device("alice").remove_contact(&bob_linked).await,
        Err(DeviceError::UnknownGroup(_))
    ));
}
