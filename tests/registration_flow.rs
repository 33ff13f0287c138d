//! End-to-end registration and formation behaviour over the SQLite backend.

use challenge_teams::{
    ChallengeStorage, LocalStorage, RegistrationService, StaticCatalog, TeamSize,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

fn setup(challenges: &[(&str, u32)]) -> (Arc<LocalStorage>, Arc<RegistrationService>) {
    let storage = Arc::new(LocalStorage::in_memory().unwrap());
    let catalog: StaticCatalog = challenges
        .iter()
        .map(|(id, size)| (id.to_string(), TeamSize::new(*size).unwrap()))
        .collect();
    let service = RegistrationService::with_storage(storage.clone(), Arc::new(catalog));
    (storage, Arc::new(service))
}

async fn group_of(service: &RegistrationService, user: &str, challenge: &str) -> Option<String> {
    service
        .check_status(Some(user), challenge)
        .await
        .unwrap()
        .group_id
}

#[tokio::test]
async fn fifo_group_formation() {
    let (_, service) = setup(&[("koans", 3)]);

    for user in ["a", "b"] {
        let outcome = service.try_register(Some(user), "koans").await.unwrap();
        assert!(outcome.group_id().is_none());
    }
    let c = service.try_register(Some("c"), "koans").await.unwrap();
    let group_id = c.group_id().expect("third registrant completes the group").to_string();

    for user in ["a", "b", "c"] {
        assert_eq!(group_of(&service, user, "koans").await.as_deref(), Some(group_id.as_str()));
    }

    let d = service.try_register(Some("d"), "koans").await.unwrap();
    assert!(d.group_id().is_none());
    let status = service.check_status(Some("d"), "koans").await.unwrap();
    assert!(status.is_registered);
    assert_eq!(status.queue_position, Some(1));

    service.try_register(Some("e"), "koans").await.unwrap();
    let f = service.try_register(Some("f"), "koans").await.unwrap();
    let second = f.group_id().unwrap().to_string();
    assert_ne!(second, group_id);
    assert_eq!(group_of(&service, "d", "koans").await.as_deref(), Some(second.as_str()));

    let groups = service.list_groups("koans").await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].members, vec!["a", "b", "c"]);
    assert_eq!(groups[1].members, vec!["d", "e", "f"]);
}

#[tokio::test]
async fn singleton_groups_form_immediately() {
    let (_, service) = setup(&[("solo", 1)]);

    let outcome = service.try_register(Some("alice"), "solo").await.unwrap();
    assert!(outcome.group_id().is_some());

    let result = service.register(Some("bob"), "solo").await;
    assert!(result.success);
    assert!(result.group_id.is_some());
    assert_ne!(result.group_id.as_deref(), outcome.group_id());
    assert_eq!(service.queue_depth("solo").await.unwrap(), 0);
}

#[tokio::test]
async fn challenges_are_independent() {
    let (_, service) = setup(&[("x", 2), ("y", 2)]);

    service.try_register(Some("alice"), "x").await.unwrap();
    let bob = service.try_register(Some("bob"), "y").await.unwrap();
    assert!(bob.group_id().is_none());
    assert_eq!(service.queue_depth("x").await.unwrap(), 1);
    assert_eq!(service.queue_depth("y").await.unwrap(), 1);

    let carol = service.try_register(Some("carol"), "x").await.unwrap();
    assert!(carol.group_id().is_some());
    assert!(service.list_groups("y").await.unwrap().is_empty());
    assert!(group_of(&service, "bob", "y").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_form_exactly_one_group() {
    let (_, service) = setup(&[("race", 4)]);

    let calls = (0..4).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .try_register(Some(&format!("user-{}", i)), "race")
                .await
                .unwrap()
        })
    });
    for outcome in join_all(calls).await {
        assert!(!outcome.unwrap().already_registered);
    }

    let groups = service.list_groups("race").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 4);
    assert_eq!(service.queue_depth("race").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_never_double_assign() {
    let (storage, service) = setup(&[("crowd", 3)]);

    let calls = (0..20).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .try_register(Some(&format!("user-{}", i)), "crowd")
                .await
                .unwrap()
        })
    });
    join_all(calls).await;

    let groups = service.list_groups("crowd").await.unwrap();
    assert_eq!(groups.len(), 6);

    let mut seen = HashSet::new();
    for group in &groups {
        assert_eq!(group.members.len(), 3);
        for member in &group.members {
            assert!(seen.insert(member.clone()), "{} is in two groups", member);
        }
    }
    assert_eq!(storage.queue_depth("crowd").await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_registrations_create_one_row() {
    let (storage, service) = setup(&[("koans", 5)]);

    let calls = (0..8).map(|_| {
        let service = service.clone();
        tokio::spawn(async move { service.try_register(Some("alice"), "koans").await.unwrap() })
    });
    let outcomes: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|o| o.unwrap())
        .collect();

    let fresh = outcomes.iter().filter(|o| !o.already_registered).count();
    assert_eq!(fresh, 1);
    let ids: HashSet<_> = outcomes.iter().map(|o| o.registration.id.clone()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(storage.queue_depth("koans").await.unwrap(), 1);
}

#[tokio::test]
async fn unregister_then_status() {
    let (_, service) = setup(&[("koans", 3)]);

    service.try_register(Some("alice"), "koans").await.unwrap();
    let result = service.unregister(Some("alice"), "koans").await;
    assert!(result.success);
    assert!(!result.is_registered);

    let status = service.check_status(Some("alice"), "koans").await.unwrap();
    assert!(!status.is_registered);
    assert!(status.group_id.is_none());

    // Re-registering after leaving queues the user again
    let again = service.try_register(Some("alice"), "koans").await.unwrap();
    assert!(!again.already_registered);
}

#[tokio::test]
async fn unknown_pair_status_is_empty() {
    let (_, service) = setup(&[("koans", 3)]);
    let status = service.check_status(Some("ghost"), "nowhere").await.unwrap();
    assert!(!status.is_registered);
    assert!(status.group_id.is_none());
    assert!(status.queue_position.is_none());
}
