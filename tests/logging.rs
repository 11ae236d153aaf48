use std::sync::Mutex;

use asktell_rs::{toy::GaussianLogPdf, Controller, ControllerSettings};
use log::{Level, LevelFilter, Log, Metadata, Record};

struct Capture;

static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());
static LOGGER: Capture = Capture;

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

fn take_info() -> Vec<String> {
    RECORDS
        .lock()
        .unwrap()
        .drain(..)
        .filter(|(level, _)| *level == Level::Info)
        .map(|(_, message)| message)
        .collect()
}

fn run(log_to_screen: bool) {
    let target = GaussianLogPdf::new(vec![0., 1.], vec![1., 1.]).unwrap();
    let settings = ControllerSettings {
        max_iterations: 50,
        initial_phase_iterations: 10,
        log_to_screen,
        ..Default::default()
    };
    let mut controller =
        Controller::adaptive_covariance(&target, &[[0.1, 0.9], [-0.1, 1.1]], 3, settings).unwrap();
    controller.run().unwrap();
}

// A single test, so that no other test in this binary writes to the logger.
#[test]
fn progress_is_logged_only_when_enabled() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Debug);

    run(false);
    assert_eq!(take_info(), Vec::<String>::new());

    run(true);
    let lines = take_info();
    assert!(lines[0].starts_with("Running 2 chains of"), "{lines:?}");
    assert!(lines.iter().any(|line| line.starts_with("Iteration 1:")));
    assert!(lines.iter().any(|line| line.starts_with("Iteration 50:")));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("Halting: maximum number of iterations (50) reached")
    );
}
