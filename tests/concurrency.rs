//! Parallel requests against one tracker.

use kennel::{
    Animal, AnimalId, Dispatcher, EntityKind, FeedingEvent, RowId, SubscriptionRegistry,
    Tracker, TrackerConfig, WeightSample,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_concurrent_joins_then_one_dispatch() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&registry));
    let c1 = registry.connect();
    let c2 = registry.connect();

    let barrier = Arc::new(Barrier::new(2));
    let joins: Vec<_> = [c1.id, c2.id]
        .into_iter()
        .map(|id| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.join(id, AnimalId(1))
            })
        })
        .collect();
    for join in joins {
        assert!(join.join().unwrap());
    }

    let report = dispatcher.dispatch(AnimalId(1), EntityKind::Weight);
    assert_eq!(report.delivered, 2);
    assert_eq!(c1.drain().len(), 1);
    assert_eq!(c2.drain().len(), 1);
}

#[test]
fn test_parallel_creates_get_distinct_ids() {
    let tracker = Arc::new(Tracker::open(TrackerConfig::in_memory()).unwrap());
    let rex: AnimalId = tracker.animals().create(Animal::new("Rex")).unwrap().into();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                (0..50)
                    .map(|_| tracker.create(FeedingEvent::new(rex, "Kibble")).unwrap().value)
                    .collect::<Vec<RowId>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for worker in workers {
        for id in worker.join().unwrap() {
            assert!(id.is_valid());
            assert!(ids.insert(id));
        }
    }
    assert_eq!(ids.len(), 400);
    assert_eq!(tracker.stats().feeding_events, 400);
}

#[test]
fn test_each_group_sees_exactly_its_commits() {
    let tracker = Arc::new(Tracker::open(TrackerConfig::in_memory()).unwrap());
    let animals: Vec<AnimalId> = ["Rex", "Bella", "Max"]
        .iter()
        .map(|name| tracker.animals().create(Animal::new(*name)).unwrap().into())
        .collect();

    let viewers: Vec<_> = animals
        .iter()
        .map(|animal| {
            let handle = tracker.registry().connect();
            tracker.registry().join(handle.id, *animal);
            handle
        })
        .collect();

    let per_animal = 40;
    let workers: Vec<_> = animals
        .iter()
        .flat_map(|animal| [*animal, *animal])
        .map(|animal| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for i in 0..per_animal / 2 {
                    tracker
                        .create(WeightSample::new(animal, 10.0 + i as f64, "kg"))
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for (viewer, animal) in viewers.iter().zip(&animals) {
        let received = viewer.drain();
        assert_eq!(received.len(), per_animal);
        assert!(received.iter().all(|n| n.animal_id == *animal));
    }
}

#[test]
fn test_connection_churn_during_dispatch() {
    let tracker = Arc::new(Tracker::open(TrackerConfig::in_memory()).unwrap());
    let rex: AnimalId = tracker.animals().create(Animal::new("Rex")).unwrap().into();

    let steady = tracker.registry().connect();
    tracker.registry().join(steady.id, rex);

    let churn = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for _ in 0..100 {
                let handle = tracker.registry().connect();
                tracker.registry().join(handle.id, rex);
                tracker.registry().on_connection_closed(handle.id);
            }
        })
    };
    for _ in 0..100 {
        tracker.create(WeightSample::new(rex, 12.5, "kg")).unwrap();
    }
    churn.join().unwrap();

    assert_eq!(steady.drain().len(), 100);
    assert_eq!(tracker.registry().connection_count(), 1);
    assert_eq!(tracker.registry().members(rex).len(), 1);
}
