//! Integration tests for parallel execution: the parallel result must
//! be indistinguishable from the sequential one, aliasing included, and
//! the first failure must cancel the rest of the operation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};

use mitosis::{
    CloneError, Cloner, ShapeBuilder, TypeMatcher, register_arc_mutex, register_vec,
};

#[derive(Debug, PartialEq)]
struct Record {
    label: String,
    weight: u64,
}

#[derive(Default)]
struct Counter {
    hits: u64,
}

#[derive(Debug)]
struct Fuse {
    armed: bool,
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        ShapeBuilder::<Record>::new()
            .with_default(|| Record {
                label: String::new(),
                weight: 0,
            })
            .field("label", |r: &Record| &r.label, |r, v| r.label = v)
            .field("weight", |r: &Record| &r.weight, |r, v| r.weight = v)
            .register();
        register_vec::<Record>();

        ShapeBuilder::<Counter>::new()
            .with_default(Counter::default)
            .field("hits", |c: &Counter| &c.hits, |c, v| c.hits = v)
            .register();
        register_arc_mutex::<Counter>();
        register_vec::<Arc<Mutex<Counter>>>();

        ShapeBuilder::<Fuse>::new()
            .with_default(|| Fuse { armed: false })
            .field("armed", |f: &Fuse| &f.armed, |f, v| f.armed = v)
            .register();
        register_vec::<Fuse>();
    });
}

#[test]
fn test_parallel_clone_matches_sequential() {
    setup();
    let source: Vec<Record> = (0..1_000)
        .map(|i| Record {
            label: format!("record-{i}"),
            weight: i,
        })
        .collect();
    let sequential = Cloner::new().clone_graph(&source).unwrap();
    let parallel = Cloner::new().parallelism(4).clone_graph(&source).unwrap();
    assert_eq!(sequential, source);
    assert_eq!(parallel, source);
}

#[test]
fn test_parallel_preserves_shared_handle_identity() {
    setup();
    let hot = Arc::new(Mutex::new(Counter { hits: 7 }));
    let mut source = Vec::new();
    for i in 0..200u64 {
        if i % 2 == 0 {
            source.push(hot.clone());
        } else {
            source.push(Arc::new(Mutex::new(Counter { hits: i })));
        }
    }
    let copy = Cloner::new().parallelism(4).clone_graph(&source).unwrap();

    let source_distinct: HashSet<usize> =
        source.iter().map(|a| Arc::as_ptr(a) as usize).collect();
    let copy_distinct: HashSet<usize> = copy.iter().map(|a| Arc::as_ptr(a) as usize).collect();
    assert_eq!(copy_distinct.len(), source_distinct.len());
    for (s, c) in source.iter().zip(&copy) {
        assert_ne!(Arc::as_ptr(s), Arc::as_ptr(c));
        assert_eq!(s.lock().unwrap().hits, c.lock().unwrap().hits);
    }
    // Every occurrence of the hot handle collapsed to one clone.
    assert!(Arc::ptr_eq(&copy[0], &copy[2]));
}

#[test]
fn test_first_failure_cancels_the_operation() {
    setup();
    let source: Vec<Fuse> = (0..64).map(|i| Fuse { armed: i == 40 }).collect();
    let err = Cloner::new()
        .parallelism(4)
        .override_policy(TypeMatcher::exact::<Fuse>(), |src, _| {
            let fuse = src.downcast_ref::<Fuse>().ok_or("wrong type")?;
            if fuse.armed {
                return Err("armed fuse reached".into());
            }
            Ok(Box::new(Fuse { armed: false }))
        })
        .clone_graph(&source)
        .unwrap_err();
    assert!(matches!(
        err,
        CloneError::UserPolicyFailure { .. } | CloneError::OperationAborted { .. }
    ));
}
