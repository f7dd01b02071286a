//! Job FSM tests

use tenant_deployer::jobs::fsm::{JobEvent, JobFsm};
use tenant_deployer::models::job::JobState;

#[test]
fn test_fsm_initial_state() {
    let fsm = JobFsm::new();
    assert_eq!(fsm.state(), JobState::Waiting);
    assert!(fsm.failure_reason().is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = JobFsm::new();

    // Waiting -> Active
    fsm.process(JobEvent::Start).unwrap();
    assert_eq!(fsm.state(), JobState::Active);

    // Active -> Completed
    fsm.process(JobEvent::Complete).unwrap();
    assert_eq!(fsm.state(), JobState::Completed);
    assert!(!fsm.state().is_pending());
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = JobFsm::new();

    fsm.process(JobEvent::Start).unwrap();
    fsm.process(JobEvent::Fail("build step failed".to_string())).unwrap();

    assert_eq!(fsm.state(), JobState::Failed);
    assert_eq!(fsm.failure_reason(), Some("build step failed"));
}

#[test]
fn test_fsm_rejects_invalid_transitions() {
    let mut fsm = JobFsm::new();
    assert!(fsm.process(JobEvent::Complete).is_err());
    assert!(fsm.process(JobEvent::Fail("early".to_string())).is_err());
    assert_eq!(fsm.state(), JobState::Waiting);
    assert!(fsm.failure_reason().is_none());

    fsm.process(JobEvent::Start).unwrap();
    assert!(fsm.process(JobEvent::Start).is_err());

    fsm.process(JobEvent::Complete).unwrap();
    assert!(fsm.process(JobEvent::Fail("late".to_string())).is_err());
    assert_eq!(fsm.state(), JobState::Completed);
}
