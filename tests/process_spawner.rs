// tests/process_spawner.rs

mod common;
use crate::common::{new_loop, run_with_timeout, settle};

use std::collections::BTreeMap;
use std::error::Error;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;
use std::time::Duration;

use emerge_engine::event_loop::EventLoop;
use emerge_engine::exec::{CapturedOutput, ChannelKind, ProcessSpawner, PtyOpener, SpawnOptions};
use emerge_engine::task::returncode::{
    self, CANCELLED, COMMAND_NOT_FOUND, Outcome, PERMISSION_DENIED, RELAY_FAILED,
};
use emerge_engine::task::{Task, TaskExt};
use emerge_engine::types::{LogWriteMode, PtyMode};
use flate2::read::MultiGzDecoder;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn Error>>;

fn spawner(event_loop: &EventLoop, name: &str, options: SpawnOptions) -> Rc<ProcessSpawner> {
    Rc::new(ProcessSpawner::new(event_loop, name, options))
}

fn captured(command: &str) -> (SpawnOptions, CapturedOutput) {
    let output = CapturedOutput::new();
    let options = SpawnOptions::shell(command)
        .capture(output.clone())
        .pty_mode(PtyMode::Never);
    (options, output)
}

/// Whatever is already buffered in the pipe; the writer may still be open.
fn read_available(read_end: OwnedFd) -> io::Result<String> {
    let mut file = File::from(read_end);
    let mut buffer = vec![0u8; 4096];
    let n = file.read(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer[..n]).into_owned())
}

/// Write into a non-blocking pipe until it refuses more.
fn fill_pipe(write_end: &OwnedFd) -> io::Result<()> {
    let mut file = File::from(write_end.try_clone()?);
    let chunk = vec![b'x'; 64 * 1024];
    loop {
        match file.write(&chunk) {
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

struct FailingPty;

impl PtyOpener for FailingPty {
    fn open_pty(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        Err(io::Error::other("no ptys here"))
    }
}

#[test]
fn captures_output_of_a_successful_command() -> TestResult {
    let lp = new_loop();
    let output = CapturedOutput::new();
    let task = spawner(
        &lp,
        "echo",
        SpawnOptions::new(["echo", "hello"])
            .capture(output.clone())
            .pty_mode(PtyMode::Never),
    );

    task.start();
    assert!(task.pid().is_some());
    assert_eq!(task.wait()?, 0);

    assert_eq!(output.to_string_lossy(), "hello\n");
    assert_eq!(task.channel_kind(), Some(ChannelKind::Pipe));
    assert_eq!(task.pid(), None, "child should have been reaped");
    Ok(())
}

#[test]
fn finishes_once_output_reaches_end_of_file() -> TestResult {
    let lp = new_loop();
    let (options, output) = captured("echo hello");
    let task = spawner(&lp, "eof", options);

    task.start();
    let rc = run_with_timeout(&lp, task.async_wait())?;
    assert_eq!(rc, 0);
    assert_eq!(output.to_string_lossy(), "hello\n");
    Ok(())
}

#[test]
fn exit_status_is_preserved() -> TestResult {
    let lp = new_loop();
    let (options, _) = captured("exit 3");
    let task = spawner(&lp, "exit3", options);

    task.start();
    let rc = task.wait()?;
    assert_eq!(rc, 3);
    assert_eq!(Outcome::from_returncode(rc), Outcome::Exited(3));
    Ok(())
}

#[test]
fn death_by_signal_is_encoded_in_the_high_byte() -> TestResult {
    let lp = new_loop();
    let (options, _) = captured("kill -9 $$");
    let task = spawner(&lp, "suicide", options);

    task.start();
    let rc = task.wait()?;
    assert_eq!(rc, returncode::from_signal(9));
    assert_eq!(Outcome::from_returncode(rc), Outcome::Signaled(9));
    Ok(())
}

#[test]
fn missing_command_reports_command_not_found_without_forking() -> TestResult {
    let lp = new_loop();
    let task = spawner(
        &lp,
        "missing",
        SpawnOptions::new(["definitely-not-a-real-command-4c1f"]).capture(CapturedOutput::new()),
    );

    task.start();
    assert_eq!(task.core().returncode(), Some(COMMAND_NOT_FOUND));
    assert_eq!(task.pid(), None);
    assert_eq!(task.wait()?, COMMAND_NOT_FOUND);
    Ok(())
}

#[test]
fn non_executable_program_reports_permission_denied() -> TestResult {
    let dir = tempdir()?;
    let script = dir.path().join("not-executable.sh");
    fs::write(&script, "#!/bin/sh\necho nope\n")?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644))?;

    let lp = new_loop();
    let task = spawner(
        &lp,
        "denied",
        SpawnOptions::new([script.as_os_str()]).capture(CapturedOutput::new()),
    );

    task.start();
    assert_eq!(task.wait()?, PERMISSION_DENIED);
    Ok(())
}

#[test]
fn failed_exec_is_reported_and_the_child_reaped_by_the_loop() -> TestResult {
    let dir = tempdir()?;
    let script = dir.path().join("bad-interpreter.sh");
    fs::write(&script, "#!/definitely/missing/interpreter\n")?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

    let lp = new_loop();
    let task = spawner(
        &lp,
        "bad-exec",
        SpawnOptions::new([script.as_os_str()]).capture(CapturedOutput::new()),
    );

    task.start();
    assert_eq!(task.core().returncode(), Some(COMMAND_NOT_FOUND));
    assert_eq!(lp.watched_children().len(), 1, "failed child is left to the loop");

    settle(&lp, 100);
    assert!(lp.watched_children().is_empty());
    assert_eq!(task.wait()?, COMMAND_NOT_FOUND);
    Ok(())
}

#[test]
fn pty_failure_falls_back_to_a_pipe() -> TestResult {
    let lp = new_loop();
    let output = CapturedOutput::new();
    let task = spawner(
        &lp,
        "fallback",
        SpawnOptions::new(["echo", "hello"])
            .capture(output.clone())
            .pty_mode(PtyMode::Always)
            .pty_opener(Rc::new(FailingPty)),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(task.channel_kind(), Some(ChannelKind::Pipe));
    assert_eq!(output.to_string_lossy(), "hello\n");
    Ok(())
}

#[test]
fn pty_output_has_no_carriage_returns() -> TestResult {
    // Works whether or not this machine can allocate ptys.
    let lp = new_loop();
    let output = CapturedOutput::new();
    let task = spawner(
        &lp,
        "pty",
        SpawnOptions::new(["echo", "hello"])
            .capture(output.clone())
            .pty_mode(PtyMode::Always),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(output.to_string_lossy(), "hello\n");
    Ok(())
}

#[test]
fn plain_log_file_receives_output_and_parent_dirs_are_created() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("logs").join("nested").join("job.log");

    let lp = new_loop();
    let task = spawner(
        &lp,
        "logged",
        SpawnOptions::shell("echo out; echo err >&2")
            .log_file(&log)
            .background(true),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(fs::read_to_string(&log)?, "out\nerr\n");
    Ok(())
}

#[test]
fn gz_log_file_is_compressed_and_appended() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("job.log.gz");

    let lp = new_loop();
    for word in ["first", "second"] {
        let task = spawner(
            &lp,
            word,
            SpawnOptions::new(["echo", word]).log_file(&log).background(true),
        );
        task.start();
        assert_eq!(task.wait()?, 0);
    }

    let mut text = String::new();
    MultiGzDecoder::new(File::open(&log)?).read_to_string(&mut text)?;
    assert_eq!(text, "first\nsecond\n");
    Ok(())
}

#[test]
fn line_mode_log_keeps_a_trailing_partial_line() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("lines.log");

    let lp = new_loop();
    let task = spawner(
        &lp,
        "lines",
        SpawnOptions::shell("printf 'a\\nb'")
            .log_file(&log)
            .log_mode(LogWriteMode::Line)
            .background(true),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(fs::read_to_string(&log)?, "a\nb");
    Ok(())
}

#[test]
fn foreground_log_is_teed_to_stdout() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("tee.log");
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;

    let lp = new_loop();
    let task = spawner(
        &lp,
        "tee",
        SpawnOptions::new(["echo", "hello"])
            .fd_pipe(1, write_end.as_raw_fd())
            .log_file(&log)
            .pty_mode(PtyMode::Never),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    drop(write_end);

    assert_eq!(fs::read_to_string(&log)?, "hello\n");
    assert_eq!(read_available(read_end)?, "hello\n");
    Ok(())
}

#[test]
fn uncaptured_output_goes_straight_to_the_mapped_stdout() -> TestResult {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;

    let lp = new_loop();
    let task = spawner(
        &lp,
        "direct",
        SpawnOptions::new(["echo", "direct"]).fd_pipe(1, write_end.as_raw_fd()),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(read_available(read_end)?, "direct\n");
    Ok(())
}

#[test]
fn extra_descriptors_are_mapped_into_the_child() -> TestResult {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;

    let lp = new_loop();
    let (options, output) = captured("echo extra >&3; echo normal");
    let task = spawner(&lp, "fd3", options.fd_pipe(3, write_end.as_raw_fd()));

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(output.to_string_lossy(), "normal\n");
    assert_eq!(read_available(read_end)?, "extra\n");
    Ok(())
}

#[test]
fn background_process_reads_end_of_file_on_stdin() -> TestResult {
    let lp = new_loop();
    let output = CapturedOutput::new();
    let task = spawner(
        &lp,
        "cat",
        SpawnOptions::new(["cat"]).background(true).capture(output.clone()),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert!(output.is_empty());
    Ok(())
}

#[test]
fn explicit_environment_replaces_the_parent_one() -> TestResult {
    let lp = new_loop();
    let env = BTreeMap::from([("FOO".to_string(), "bar".to_string())]);
    let (options, output) = captured("echo \"$FOO:$HOME\"");
    let task = spawner(&lp, "env", options.env(env));

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(output.to_string_lossy(), "bar:\n");
    Ok(())
}

#[test]
fn environment_overlay_keeps_the_parent_environment() -> TestResult {
    let lp = new_loop();
    let (options, output) = captured("echo \"$EMERGE_TEST_VALUE\"");
    let task = spawner(
        &lp,
        "overlay",
        options.env_overlay([("EMERGE_TEST_VALUE", "layered")]),
    );

    task.start();
    assert_eq!(task.wait()?, 0);
    assert_eq!(output.to_string_lossy(), "layered\n");
    Ok(())
}

#[test]
fn working_directory_is_applied() -> TestResult {
    let dir = tempdir()?;
    let lp = new_loop();
    let (options, output) = captured("pwd -P");
    let task = spawner(&lp, "cwd", options.cwd(dir.path()));

    task.start();
    assert_eq!(task.wait()?, 0);
    let expected = dir.path().canonicalize()?;
    assert_eq!(output.to_string_lossy().trim_end(), expected.to_string_lossy());
    Ok(())
}

#[test]
fn cancelling_a_running_process_terminates_and_reaps_it() -> TestResult {
    let lp = new_loop();
    let (options, _) = captured("sleep 30");
    let task = spawner(&lp, "sleeper", options);

    task.start();
    settle(&lp, 50);
    assert!(task.is_alive());

    task.cancel();
    assert_eq!(task.wait()?, CANCELLED);
    assert_eq!(task.pid(), None);
    Ok(())
}

#[test]
fn process_ignoring_sigterm_is_killed_after_the_timeout() -> TestResult {
    let lp = new_loop();
    let (options, _) = captured("trap '' TERM; while :; do :; done");
    let task = spawner(
        &lp,
        "stubborn",
        options.kill_timeout(Duration::from_millis(100)),
    );

    task.start();
    settle(&lp, 200);
    task.cancel();

    assert_eq!(task.wait()?, CANCELLED);
    assert_eq!(task.pid(), None);
    Ok(())
}

#[test]
fn cancel_before_start_never_spawns() -> TestResult {
    let lp = new_loop();
    let (options, _) = captured("echo never");
    let task = spawner(&lp, "unstarted", options);

    task.cancel();
    task.start();
    assert_eq!(task.pid(), None);
    assert_eq!(task.channel_kind(), None);
    assert_eq!(task.wait()?, CANCELLED);
    Ok(())
}

#[test]
fn stdout_that_stays_unwritable_fails_the_relay() -> TestResult {
    let dir = tempdir()?;
    let log = dir.path().join("tee.log");
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    fill_pipe(&write_end)?;

    let lp = new_loop();
    let task = spawner(
        &lp,
        "blocked-tee",
        SpawnOptions::new(["echo", "hello"])
            .fd_pipe(1, write_end.as_raw_fd())
            .log_file(&log)
            .pty_mode(PtyMode::Never),
    );

    task.start();
    let rc = run_with_timeout(&lp, task.async_wait())?;
    assert_eq!(rc, RELAY_FAILED, "a clean exit is reported as a relay failure");
    assert_eq!(fs::read_to_string(&log)?, "hello\n");
    assert_eq!(task.pid(), None);
    drop(read_end);
    Ok(())
}

#[test]
fn log_write_error_still_waits_for_the_real_exit_status() -> TestResult {
    if !std::path::Path::new("/dev/full").exists() {
        return Ok(());
    }

    let lp = new_loop();
    for (command, expected) in [("echo hello", RELAY_FAILED), ("echo hello; exit 4", 4)] {
        let task = spawner(
            &lp,
            command,
            SpawnOptions::shell(command)
                .log_file("/dev/full")
                .background(true),
        );

        task.start();
        assert_eq!(task.wait()?, expected, "{command}");
        assert_eq!(task.pid(), None, "{command}: child should have been reaped");
    }
    Ok(())
}
