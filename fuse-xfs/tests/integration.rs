use assert_cmd::Command;

#[test]
fn version() {
	Command::cargo_bin("fuse-xfs")
		.unwrap()
		.arg("--version")
		.assert()
		.success();
}

#[test]
fn help_lists_the_mount_surface() {
	let out = Command::cargo_bin("fuse-xfs")
		.unwrap()
		.arg("--help")
		.assert()
		.success();
	let help = String::from_utf8_lossy(&out.get_output().stdout).to_lowercase();
	assert!(help.contains("device"));
	assert!(help.contains("mountpoint"));
	assert!(help.contains("--rw"));
}

#[test]
fn missing_device_fails() {
	Command::cargo_bin("fuse-xfs")
		.unwrap()
		.assert()
		.failure();
}
