#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: move the booking from 101 to 102
    let mut csv1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv1, "from_room, to_room").unwrap();
    writeln!(csv1, "101, 102").unwrap();

    let mut cmd1 = Command::new(cargo_bin!("roomflow"));
    cmd1.arg(csv1.path()).arg("--db-path").arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains("orch.101.102,completed,true,Room booked!"));

    // 2. Second run on the same DB: 102 is still booked, and the first
    //    request is answered from the stored instance.
    let mut csv2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv2, "from_room, to_room").unwrap();
    writeln!(csv2, "102, 103").unwrap();
    writeln!(csv2, "101, 102").unwrap();

    let mut cmd2 = Command::new(cargo_bin!("roomflow"));
    cmd2.arg(csv2.path()).arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    assert!(stdout2.contains("orch.102.103,completed,false,Room already booked!"));
    assert!(stdout2.contains("orch.101.102,completed,true,Room booked!"));
}
