use std::{fs, process::Command, time::SystemTime};

fn main() {
  let now = SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap()
    .as_millis();
  println!("cargo:rustc-env=BUILD_TIME={}", now);

  println!("cargo:rerun-if-changed=.git/HEAD");

  println!("cargo:rustc-env=GIT_BRANCH={}", git_output(&["rev-parse", "--abbrev-ref", "HEAD"]));
  println!("cargo:rustc-env=GIT_COMMIT={}", git_output(&["rev-parse", "HEAD"]));
}

fn git_output(args: &[&str]) -> String {
  if let Ok(output) = Command::new("git").args(args).output() {
    if output.status.success() {
      return String::from_utf8_lossy(&output.stdout).trim().to_string();
    }
  }

  // No git binary: fall back to reading .git directly
  if let Ok(head) = fs::read_to_string(".git/HEAD") {
    let head = head.trim();
    if let Some(ref_path) = head.strip_prefix("ref: ") {
      if args.contains(&"--abbrev-ref") {
        return ref_path.split('/').next_back().unwrap_or("unknown").to_string();
      }
      if let Ok(commit) = fs::read_to_string(format!(".git/{}", ref_path)) {
        return commit.trim().to_string();
      }
    } else if !args.contains(&"--abbrev-ref") {
      return head.to_string();
    }
  }

  "unknown".to_string()
}
