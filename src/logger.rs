use std::{
    fmt::Display,
    io::{stdout, Write},
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::Instant,
};

static CBCS: AtomicBool = AtomicBool::new(false);

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m{}", esc())
}

pub fn clear_colours() {
    print!("{}", esc());
}

pub fn set_cbcs(val: bool) {
    CBCS.store(val, SeqCst)
}

pub fn num_cs() -> i32 {
    if CBCS.load(SeqCst) {
        35
    } else {
        36
    }
}

fn esc() -> &'static str {
    if CBCS.load(SeqCst) {
        "\x1b[38;5;225m"
    } else {
        ""
    }
}

pub fn report_run_started(num_devices: usize, steps: usize) {
    clear_colours();
    println!("{}", ansi("Beginning Synchronous Run", "34;1"));
    println!("devices: {}", ansi(num_devices, num_cs()));
    println!("steps: {}", ansi(steps, num_cs()));
}

pub fn report_tree_depth(depth: u32) {
    println!("tree depth: {}", ansi(depth, num_cs()));
}

pub fn report_step_progress(step: usize, steps: usize, timer: &Instant) {
    let num_cs = num_cs();
    let elapsed = timer.elapsed().as_secs_f32();
    let pct = step as f32 / steps as f32;
    let seconds = elapsed / pct - elapsed;

    print!(
        "step {} / {} [{}% (eta {}s)]     \r",
        ansi(step, num_cs),
        ansi(steps, num_cs),
        ansi(format!("{:.1}", pct * 100.0), 35),
        ansi(format!("{seconds:.1}"), num_cs),
    );
    let _ = stdout().flush();
}

pub fn report_run_finished(steps: usize, time: f32) {
    println!(
        "Finished {} steps in {}s",
        ansi(steps, num_cs()),
        ansi(format!("{time:.2}"), num_cs()),
    );
}

pub fn seconds_to_hms(mut seconds: u32) -> (u32, u32, u32) {
    let mut minutes = seconds / 60;
    let hours = minutes / 60;
    seconds -= minutes * 60;
    minutes -= hours * 60;

    (hours, minutes, seconds)
}
