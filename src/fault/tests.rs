use super::*;
use crate::{host::DetachedHost, util::trace_init};
use std::sync::{Arc, Mutex as StdMutex};

#[derive(Default)]
struct Recorder {
    kicks: StdMutex<Vec<(CpuId, KickFlags)>>,
    unloads: StdMutex<Vec<ExitInfo>>,
}

impl Host for Arc<Recorder> {
    fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        self.kicks.lock().unwrap().push((cpu, flags));
    }

    fn request_unload(&self, exit: &ExitInfo) {
        self.unloads.lock().unwrap().push(exit.clone());
    }
}

fn reporter() -> (ErrorReporter, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (ErrorReporter::new(Box::new(recorder.clone()), 4), recorder)
}

#[test]
fn first_reporter_wins() {
    let _trace = trace_init();
    let (reporter, recorder) = reporter();
    assert!(reporter.is_enabled());
    assert_eq!(reporter.exit_info(), None);

    assert!(crate::fatal!(reporter, "corrupt queue {}", 5));
    assert!(!reporter.is_enabled());
    assert!(!crate::fatal!(reporter, "second fault"));
    assert!(!reporter.unregister());

    let exit = reporter.exit_info().unwrap();
    assert_eq!(exit.kind, ExitKind::Error);
    assert_eq!(exit.msg, "corrupt queue 5");
    assert_eq!(exit.cpu, None);
    assert_eq!(*recorder.unloads.lock().unwrap(), [exit]);
}

#[test]
fn fault_records_invoking_cpu() {
    let _trace = trace_init();
    let (reporter, _) = reporter();
    {
        let _guard = context::AtomicGuard::enter_cpu(3);
        assert!(crate::fatal!(reporter, "oops"));
    }
    assert_eq!(reporter.exit_info().unwrap().cpu, Some(3));
}

#[test]
fn unregister_is_not_an_error() {
    let _trace = trace_init();
    let (reporter, recorder) = reporter();
    assert!(reporter.unregister());
    assert_eq!(reporter.exit_info().unwrap().kind, ExitKind::Unregistered);
    assert_eq!(recorder.unloads.lock().unwrap().len(), 1);
}

#[test]
fn long_messages_are_truncated() {
    let _trace = trace_init();
    let (reporter, _) = reporter();
    let long = "é".repeat(EXIT_MSG_LEN);
    assert!(reporter.report_fatal(format_args!("{long}")));
    let msg = reporter.exit_info().unwrap().msg;
    assert!(msg.len() <= EXIT_MSG_LEN);
    assert_eq!(msg.len(), EXIT_MSG_LEN);
    assert!(msg.chars().all(|c| c == 'é'));
}

#[test]
fn kicks_are_gated() {
    let _trace = trace_init();
    let (reporter, recorder) = reporter();
    let preempt = KickFlags::new().with(KickFlags::PREEMPT, true);
    assert_eq!(reporter.request_cpu_kick(1, preempt), Ok(()));
    assert_eq!(
        reporter.request_cpu_kick(4, KickFlags::NONE),
        Err(KickError::Bounds(BoundsError { index: 4, len: 4 }))
    );
    assert!(crate::fatal!(reporter, "stop"));
    assert_eq!(
        reporter.request_cpu_kick(1, KickFlags::NONE),
        Err(KickError::Disabled)
    );
    assert_eq!(*recorder.kicks.lock().unwrap(), [(1, preempt)]);
}

#[test]
fn finish_defaults_to_done() {
    let reporter = ErrorReporter::new(Box::new(DetachedHost::new()), 1);
    let exit = reporter.finish();
    assert_eq!(exit.kind, ExitKind::Done);
    assert!(exit.msg.is_empty());
}
