//! Assertion and polling macros

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}

/// Assert the ids of a snapshot's messages, in order
#[macro_export]
macro_rules! assert_ids {
    ($snapshot:expr, $expected:expr) => {{
        let ids: Vec<u64> = $snapshot.messages.iter().map(|m| m.id).collect();
        let expected: Vec<u64> = $expected.into_iter().collect();
        pretty_assertions::assert_eq!(ids, expected);
    }};
}

/// Poll `$cond` every few milliseconds, failing after two seconds
#[macro_export]
macro_rules! eventually {
    ($cond:expr) => {
        $crate::eventually!($cond, "condition was not reached in time")
    };
    ($cond:expr, $message:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("{}", $message);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}
