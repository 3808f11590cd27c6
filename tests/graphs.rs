//! Integration tests for whole-graph cloning under the accessor
//! mechanism: value fidelity, aliasing preservation, cycles, deep
//! chains, error reporting and per-call overrides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, RwLock};
use std::time::Duration;

use mitosis::{
    CloneError, Cloner, ShapeBuilder, TypeMatcher, UnsupportedField, clone_graph, register_arc,
    register_arc_mutex, register_arc_rwlock, register_boxed, register_hash_map, register_option,
    register_passthrough, register_policy, register_value, register_vec,
};

#[derive(Debug, PartialEq)]
struct Person {
    name: String,
    age: u32,
    tags: Vec<String>,
}

#[derive(Default)]
struct Node {
    id: u32,
    next: Option<Arc<Mutex<Node>>>,
}

struct Link {
    value: u64,
    next: Option<Box<Link>>,
}

// The deep-chain fixture would otherwise overflow the stack in its
// recursive default drop.
impl Drop for Link {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(mut link) = next {
            next = link.next.take();
        }
    }
}

struct Holder {
    wrapped: Wrapped,
    direct: Arc<String>,
}

struct Wrapped {
    inner: Arc<String>,
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        ShapeBuilder::<Person>::new()
            .with_default(|| Person {
                name: String::new(),
                age: 0,
                tags: Vec::new(),
            })
            .field("name", |p: &Person| &p.name, |p, v| p.name = v)
            .field("age", |p: &Person| &p.age, |p, v| p.age = v)
            .field("tags", |p: &Person| &p.tags, |p, v| p.tags = v)
            .register();
        register_vec::<String>();
        register_vec::<Person>();

        ShapeBuilder::<Node>::new()
            .with_default(Node::default)
            .field("id", |n: &Node| &n.id, |n, v| n.id = v)
            .field("next", |n: &Node| &n.next, |n, v| n.next = v)
            .register();
        register_arc_mutex::<Node>();
        register_arc_rwlock::<Node>();
        register_option::<Arc<Mutex<Node>>>();
        register_vec::<Arc<Mutex<Node>>>();

        ShapeBuilder::<Link>::new()
            .with_default(|| Link {
                value: 0,
                next: None,
            })
            .field("value", |l: &Link| &l.value, |l, v| l.value = v)
            .field("next", |l: &Link| &l.next, |l, v| l.next = v)
            .register();
        register_boxed::<Link>();
        register_option::<Box<Link>>();

        register_arc::<String>();
        register_vec::<Arc<String>>();
        register_passthrough::<Arc<str>>();
        register_hash_map::<String, u64>();

        ShapeBuilder::<Holder>::new()
            .with_default(|| Holder {
                wrapped: Wrapped {
                    inner: Arc::new(String::new()),
                },
                direct: Arc::new(String::new()),
            })
            .field("wrapped", |h: &Holder| &h.wrapped, |h, v| h.wrapped = v)
            .field("direct", |h: &Holder| &h.direct, |h, v| h.direct = v)
            .register();
        ShapeBuilder::<Wrapped>::new()
            .with_default(|| Wrapped {
                inner: Arc::new(String::new()),
            })
            .field("inner", |w: &Wrapped| &w.inner, |w, v| w.inner = v)
            .register();
    });
}

// ---------------------------------------------------------------------------
// Value fidelity
// ---------------------------------------------------------------------------

#[test]
fn test_acyclic_struct_clones_field_for_field() {
    setup();
    let source = Person {
        name: "ada".to_string(),
        age: 36,
        tags: vec!["math".to_string(), "engines".to_string()],
    };
    let copy = clone_graph(&source).unwrap();
    assert_eq!(copy, source);
    assert_ne!(copy.name.as_ptr(), source.name.as_ptr());
}

#[test]
fn test_empty_containers_and_none_survive() {
    setup();
    let source = Person {
        name: String::new(),
        age: 0,
        tags: Vec::new(),
    };
    let copy = clone_graph(&source).unwrap();
    assert_eq!(copy, source);

    let none: Option<Box<Link>> = None;
    let copy = clone_graph(&none).unwrap();
    assert!(copy.is_none());
}

#[test]
fn test_hash_map_is_rebuilt_under_cloned_keys() {
    setup();
    let mut source = HashMap::new();
    source.insert("alpha".to_string(), 1u64);
    source.insert("beta".to_string(), 2u64);
    let copy = clone_graph(&source).unwrap();
    assert_eq!(copy, source);
    let source_key = source.keys().find(|k| k.as_str() == "alpha").unwrap();
    let copy_key = copy.keys().find(|k| k.as_str() == "alpha").unwrap();
    assert_ne!(source_key.as_ptr(), copy_key.as_ptr());
}

// ---------------------------------------------------------------------------
// Aliasing and cycles
// ---------------------------------------------------------------------------

#[test]
fn test_shared_handle_is_cloned_once() {
    setup();
    let shared = Arc::new("payload".to_string());
    let source = vec![shared.clone(), shared.clone(), Arc::new("other".to_string())];
    let copy = clone_graph(&source).unwrap();
    assert!(Arc::ptr_eq(&copy[0], &copy[1]));
    assert!(!Arc::ptr_eq(&copy[0], &copy[2]));
    assert!(!Arc::ptr_eq(&copy[0], &shared));
    assert_eq!(*copy[0], "payload");
}

#[test]
fn test_shared_lock_node_aliasing_survives() {
    setup();
    let node = Arc::new(Mutex::new(Node { id: 5, next: None }));
    let source = vec![node.clone(), node.clone()];
    let copy = clone_graph(&source).unwrap();
    assert!(Arc::ptr_eq(&copy[0], &copy[1]));
    assert!(!Arc::ptr_eq(&copy[0], &node));
    assert_eq!(copy[0].lock().unwrap().id, 5);
}

#[test]
fn test_cycle_through_lock_handles_comes_out_cyclic() {
    setup();
    let a = Arc::new(Mutex::new(Node { id: 1, next: None }));
    let b = Arc::new(Mutex::new(Node {
        id: 2,
        next: Some(a.clone()),
    }));
    a.lock().unwrap().next = Some(b.clone());

    let copy = clone_graph(&a).unwrap();
    assert!(!Arc::ptr_eq(&copy, &a));
    let copy_b = copy.lock().unwrap().next.clone().unwrap();
    assert!(!Arc::ptr_eq(&copy_b, &b));
    assert_eq!(copy_b.lock().unwrap().id, 2);
    let back = copy_b.lock().unwrap().next.clone().unwrap();
    assert!(Arc::ptr_eq(&back, &copy));

    // Break the source cycle so the fixture can drop.
    a.lock().unwrap().next = None;
    copy.lock().unwrap().next = None;
}

#[test]
fn test_rwlock_nodes_clone_behind_fresh_locks() {
    setup();
    let source = Arc::new(RwLock::new(Node { id: 9, next: None }));
    let copy = clone_graph(&source).unwrap();
    assert!(!Arc::ptr_eq(&copy, &source));
    assert_eq!(copy.read().unwrap().id, 9);
}

#[test]
fn test_passthrough_shares_the_source_allocation() {
    setup();
    let interned: Arc<str> = Arc::from("constant");
    let copy = clone_graph(&interned).unwrap();
    assert!(Arc::ptr_eq(&copy, &interned));
}

#[test]
fn test_two_operations_never_share_clones() {
    setup();
    let shared = Arc::new("payload".to_string());
    let source = vec![shared.clone(), shared];
    let first = clone_graph(&source).unwrap();
    let second = clone_graph(&source).unwrap();
    assert!(!Arc::ptr_eq(&first[0], &second[0]));
}

// ---------------------------------------------------------------------------
// Depth
// ---------------------------------------------------------------------------

#[test]
fn test_hundred_thousand_deep_chain_clones_without_recursion() {
    setup();
    let mut head = Link {
        value: 0,
        next: None,
    };
    for value in 1..100_000u64 {
        head = Link {
            value,
            next: Some(Box::new(head)),
        };
    }
    let copy = clone_graph(&head).unwrap();

    let mut depth = 0u64;
    let mut cursor = Some(&copy);
    let mut last = 0;
    while let Some(link) = cursor {
        depth += 1;
        last = link.value;
        cursor = link.next.as_deref();
    }
    assert_eq!(depth, 100_000);
    assert_eq!(copy.value, 99_999);
    assert_eq!(last, 0);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn test_unregistered_type_reports_allocation_failure() {
    setup();
    #[derive(Debug)]
    struct Opaque;
    let err = clone_graph(&Opaque).unwrap_err();
    assert!(matches!(err, CloneError::AllocationFailure { .. }));
    assert!(err.to_string().contains("no copy policy"));
}

#[test]
fn test_failure_carries_the_field_path() {
    setup();
    #[derive(Debug)]
    struct Unknown;
    #[derive(Debug)]
    struct HasBad {
        bad: Unknown,
    }
    ShapeBuilder::<HasBad>::new()
        .with_default(|| HasBad { bad: Unknown })
        .field("bad", |h: &HasBad| &h.bad, |h, v| h.bad = v)
        .register();

    let err = clone_graph(&HasBad { bad: Unknown }).unwrap_err();
    assert!(err.to_string().contains(".bad"));
}

#[test]
fn test_zero_timeout_aborts_the_operation() {
    setup();
    let source = Person {
        name: "late".to_string(),
        age: 1,
        tags: Vec::new(),
    };
    let err = Cloner::new()
        .timeout(Duration::ZERO)
        .clone_graph(&source)
        .unwrap_err();
    assert!(matches!(err, CloneError::OperationAborted { .. }));
}

// ---------------------------------------------------------------------------
// Unreadable fields
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct Gauge {
    visible: u32,
    hidden: u64,
}

fn register_gauge() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        ShapeBuilder::<Gauge>::new()
            .with_default(|| Gauge {
                visible: 0,
                hidden: 42,
            })
            .field("visible", |g: &Gauge| &g.visible, |g, v| g.visible = v)
            .raw_field::<u64>("hidden", std::mem::offset_of!(Gauge, hidden))
            .register();
    });
}

#[test]
fn test_offset_only_field_fails_without_the_raw_capability() {
    setup();
    register_gauge();
    let source = Gauge {
        visible: 7,
        hidden: 99,
    };
    let err = clone_graph(&source).unwrap_err();
    assert!(matches!(err, CloneError::FieldAccessFailure { .. }));
    assert!(err.to_string().contains(".hidden"));
}

#[test]
fn test_offset_only_field_can_be_skipped_with_default() {
    setup();
    register_gauge();
    let source = Gauge {
        visible: 7,
        hidden: 99,
    };
    let copy = Cloner::new()
        .on_unsupported_field(UnsupportedField::SkipWithDefault)
        .clone_graph(&source)
        .unwrap();
    assert_eq!(copy.visible, 7);
    // Left at the shell constructor's value.
    assert_eq!(copy.hidden, 42);
}

// ---------------------------------------------------------------------------
// Per-call overrides
// ---------------------------------------------------------------------------

#[test]
fn test_override_outranks_the_registered_shape() {
    setup();
    let source = Person {
        name: "secret".to_string(),
        age: 50,
        tags: Vec::new(),
    };
    let copy = Cloner::new()
        .override_policy(TypeMatcher::exact::<Person>(), |_, _| {
            Ok(Box::new(Person {
                name: "redacted".to_string(),
                age: 0,
                tags: Vec::new(),
            }))
        })
        .clone_graph(&source)
        .unwrap();
    assert_eq!(copy.name, "redacted");
    assert_eq!(copy.age, 0);
}

#[test]
fn test_override_error_is_reported_as_policy_failure() {
    setup();
    let source = Person {
        name: "x".to_string(),
        age: 1,
        tags: Vec::new(),
    };
    let err = Cloner::new()
        .override_policy(TypeMatcher::exact::<Person>(), |_, _| {
            Err("records of this kind must not be copied".into())
        })
        .clone_graph(&source)
        .unwrap_err();
    match err {
        CloneError::UserPolicyFailure { source, .. } => {
            assert!(source.to_string().contains("must not be copied"));
        }
        other => panic!("expected a policy failure, got {other}"),
    }
}

#[test]
fn test_register_value_uses_clone_directly() {
    setup();
    register_value::<Duration>();
    let copy = clone_graph(&Duration::from_secs(3)).unwrap();
    assert_eq!(copy, Duration::from_secs(3));
}

#[test]
fn test_global_policy_applies_to_matching_values() {
    setup();
    #[derive(Debug)]
    struct Marked(u32);
    register_policy(
        TypeMatcher::predicate(|src| src.downcast_ref::<Marked>().is_some()),
        |src, _| {
            let marked = src.downcast_ref::<Marked>().ok_or("wrong type")?;
            Ok(Box::new(Marked(marked.0 + 1)))
        },
    );
    let copy = clone_graph(&Marked(41)).unwrap();
    assert_eq!(copy.0, 42);
}

#[test]
fn test_reentrant_override_joins_the_surrounding_operation() {
    setup();
    let inner = Arc::new("shared".to_string());
    let source = Holder {
        wrapped: Wrapped {
            inner: inner.clone(),
        },
        direct: inner,
    };
    let copy = Cloner::new()
        .override_policy(TypeMatcher::exact::<Wrapped>(), |src, scope| {
            let wrapped = src.downcast_ref::<Wrapped>().ok_or("wrong type")?;
            let inner = scope.copy(&wrapped.inner)?;
            let inner = inner.downcast::<Arc<String>>().map_err(|_| "wrong clone")?;
            Ok(Box::new(Wrapped { inner: *inner }))
        })
        .clone_graph(&source)
        .unwrap();
    // The handle cloned inside the override and the one cloned by the
    // engine resolve to the same clone allocation.
    assert!(Arc::ptr_eq(&copy.wrapped.inner, &copy.direct));
    assert!(!Arc::ptr_eq(&copy.direct, &source.direct));
}

// The identity reservation is taken before any shell exists, so a
// handle seen twice builds its shell exactly once.
#[test]
fn test_owner_allocates_the_shared_shell_exactly_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    setup();
    static SHELL_DEFAULTS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Debug, PartialEq)]
    struct Meterbox {
        reading: u64,
    }
    impl Default for Meterbox {
        fn default() -> Self {
            SHELL_DEFAULTS.fetch_add(1, Ordering::SeqCst);
            Meterbox { reading: 0 }
        }
    }
    struct MeterPair {
        left: Arc<Mutex<Meterbox>>,
        right: Arc<Mutex<Meterbox>>,
    }

    register_value::<Meterbox>();
    register_arc_mutex::<Meterbox>();
    ShapeBuilder::<MeterPair>::new()
        .with_default(|| MeterPair {
            left: Arc::new(Mutex::new(Meterbox { reading: 0 })),
            right: Arc::new(Mutex::new(Meterbox { reading: 0 })),
        })
        .field("left", |p: &MeterPair| &p.left, |p, v| p.left = v)
        .field("right", |p: &MeterPair| &p.right, |p, v| p.right = v)
        .register();

    let shared = Arc::new(Mutex::new(Meterbox { reading: 5 }));
    let source = MeterPair {
        left: shared.clone(),
        right: shared,
    };
    let before = SHELL_DEFAULTS.load(Ordering::SeqCst);
    let copy = clone_graph(&source).unwrap();
    assert!(Arc::ptr_eq(&copy.left, &copy.right));
    assert_eq!(copy.left.lock().unwrap().reading, 5);
    assert_eq!(SHELL_DEFAULTS.load(Ordering::SeqCst) - before, 1);
}
