use std::time::Duration;

use test_timeout::tokio_timeout_test;
use tokio::time::Instant;

#[tokio_timeout_test(5, paused)]
async fn paused_tests_may_outlast_their_wall_clock_limit() {
    let started = Instant::now();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(started.elapsed() >= Duration::from_secs(120));
}

#[tokio_timeout_test(5)]
async fn unpaused_tests_run_on_the_real_clock() {
    let started = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test_timeout::timeout(5)]
fn sync_tests_are_guarded_too() {
    assert_eq!(2 + 2, 4);
}
