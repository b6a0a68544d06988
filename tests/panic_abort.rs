//! A panic inside a channel-delivered flight must take the process down.
//!
//! A channel caller has no way to re-raise a panic, so delivering nothing
//! would strand every receiver forever; the only safe default is a crash
//! the caller cannot intercept. Verifying that means watching a whole
//! process die: each test re-executes its own binary with an environment
//! flag and asserts the child aborted with the work function's panic
//! message, without the channel ever yielding.

use std::process::Command;
use std::sync::Arc;

use rsflight::Group;

const CHILD_ENV: &str = "RSFLIGHT_PANIC_CHILD";

fn run_self(test_name: &str) -> std::process::Output {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn test subprocess")
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn panic_in_work_chan_aborts_the_process() {
    if std::env::var(CHILD_ENV).is_ok() {
        child_panic_in_work_chan();
        return;
    }

    let output = run_self("panic_in_work_chan_aborts_the_process");
    let all = combined_output(&output);
    assert!(!output.status.success(), "child must crash, got:\n{all}");
    assert!(
        all.contains("panicking in work_chan"),
        "crash must come from the work function, got:\n{all}"
    );
    assert!(
        !all.contains("receiver unexpectedly yielded"),
        "channel must never deliver, got:\n{all}"
    );
}

fn child_panic_in_work_chan() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let group = Arc::new(Group::<String, u32>::new());
        let mut rx = group.work_chan("key".to_string(), || async {
            if true {
                panic!("panicking in work_chan");
            }
            Ok::<u32, anyhow::Error>(0)
        });
        let _ = rx.recv().await;
        eprintln!("receiver unexpectedly yielded");
    });
}

#[test]
fn panic_in_flight_shared_with_channel_waiters_aborts() {
    if std::env::var(CHILD_ENV).is_ok() {
        child_panic_in_shared_flight();
        return;
    }

    let output = run_self("panic_in_flight_shared_with_channel_waiters_aborts");
    let all = combined_output(&output);
    assert!(!output.status.success(), "child must crash, got:\n{all}");
    assert!(
        all.contains("panicking in shared flight"),
        "crash must come from the first caller's work function, got:\n{all}"
    );
    assert!(
        !all.contains("chan callback unexpectedly executed"),
        "the joining caller must not run its own function, got:\n{all}"
    );
}

fn child_panic_in_shared_flight() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let group = Arc::new(Group::<String, u32>::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (unblock_tx, unblock_rx) = tokio::sync::oneshot::channel::<()>();

        // A synchronous caller leads; the panic happens only after a
        // channel caller has attached to the same record.
        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .work("key".to_string(), move || async move {
                        started_tx.send(()).unwrap();
                        unblock_rx.await.unwrap();
                        if true {
                            panic!("panicking in shared flight");
                        }
                        Ok::<u32, anyhow::Error>(0)
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let mut rx = group.work_chan("key".to_string(), || async {
            if true {
                panic!("chan callback unexpectedly executed");
            }
            Ok::<u32, anyhow::Error>(0)
        });

        unblock_tx.send(()).unwrap();
        let _ = rx.recv().await;
        let _ = leader.await;
        eprintln!("receiver unexpectedly yielded");
    });
}
