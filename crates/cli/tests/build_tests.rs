//! End-to-end build scenarios for the knit binary.
//!
//! Recipes use `cat` and `tr` as stand-in compilers so the tests run
//! anywhere a POSIX shell exists. Each test gets its own temp project.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct TestEnv {
  temp: TempDir,
}

impl TestEnv {
  fn new(knitfile: &str) -> TestEnv {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("knitfile"), knitfile).unwrap();
    TestEnv { temp }
  }

  fn path(&self, name: &str) -> PathBuf {
    self.temp.path().join(name)
  }

  fn write(&self, name: &str, content: &str) {
    fs::write(self.path(name), content).unwrap();
  }

  fn read(&self, name: &str) -> String {
    fs::read_to_string(self.path(name)).unwrap()
  }

  fn exists(&self, name: &str) -> bool {
    self.path(name).exists()
  }

  fn mtime(&self, name: &str) -> SystemTime {
    fs::metadata(self.path(name)).unwrap().modified().unwrap()
  }

  fn knit(&self) -> Command {
    let mut cmd = Command::cargo_bin("knit").unwrap();
    cmd.current_dir(self.temp.path());
    cmd
  }
}

/// The S1 project: a two-stage "compile and link" pipeline where the
/// compiler is `$cc` (default `cat`), interpolated into both recipes.
const COMPILE: &str = r#"
cc = cli.cc or "cat"

return r{
[[
hello: hello.o
    $cc hello.o > hello
]],
[[
%.o: %.c
    $cc $input > $output
]],
}
"#;

// =============================================================================
// S1: compile, quiescence, and hash-vs-mtime staleness
// =============================================================================

#[test]
fn s1_compile_then_nothing_to_do() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "int main(){return 0;}\n");

  env.knit().arg("hello").assert().success();
  assert_eq!(env.read("hello"), "int main(){return 0;}\n");

  env
    .knit()
    .arg("hello")
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done"));
}

#[test]
fn s1_mtime_bump_is_invisible_with_hashing() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "int main(){return 0;}\n");
  env.knit().arg("hello").assert().success();

  std::thread::sleep(std::time::Duration::from_millis(20));
  env.write("hello.c", "int main(){return 0;}\n");

  env
    .knit()
    .arg("hello")
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done"));
}

#[test]
fn s1_mtime_bump_rebuilds_without_hashing() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "int main(){return 0;}\n");
  env.knit().args(["--hash", "false", "hello"]).assert().success();

  std::thread::sleep(std::time::Duration::from_millis(20));
  env.write("hello.c", "int main(){return 0;}\n");

  env
    .knit()
    .args(["--hash", "false", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done").not());
}

#[test]
fn default_target_is_the_first_rule() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().assert().success();
  assert!(env.exists("hello"));
}

// =============================================================================
// S2: dynamic task elision
// =============================================================================

#[test]
fn s2_unchanged_object_skips_relink() {
  // The "compiler" strips spaces, so a whitespace-only source change
  // yields an identical object file.
  let knitfile = r#"
return r{
[[
hello: hello.o
    cat hello.o > hello
]],
[[
%.o: %.c
    tr -d ' ' < $input > $output
]],
}
"#;
  let env = TestEnv::new(knitfile);
  env.write("hello.c", "int  main\n");
  env.knit().arg("hello").assert().success();
  let linked_at = env.mtime("hello");

  std::thread::sleep(std::time::Duration::from_millis(20));
  env.write("hello.c", "int main\n");

  // The object recompiles (so this is not "nothing to be done"), but the
  // link step is elided.
  env
    .knit()
    .arg("hello")
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done").not());
  assert_eq!(env.mtime("hello"), linked_at);
}

// =============================================================================
// S3: recipe-change sensitivity via cli variables
// =============================================================================

#[test]
fn s3_cli_variable_change_rebuilds_affected_recipes() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().arg("hello").assert().success();
  let first_link = env.mtime("hello");

  std::thread::sleep(std::time::Duration::from_millis(20));

  // /bin/cat behaves like cat but the expanded recipe text differs.
  env
    .knit()
    .args(["cc=/bin/cat", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done").not());
  assert!(env.mtime("hello") > first_link);

  // Same assignment again: quiescent.
  env
    .knit()
    .args(["cc=/bin/cat", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done"));
}

// =============================================================================
// S4: cycles
// =============================================================================

#[test]
fn s4_cycle_is_a_config_error() {
  let knitfile = r#"
return r{
[[
a: b
    touch a
]],
[[
b: a
    touch b
]],
}
"#;
  let env = TestEnv::new(knitfile);
  env
    .knit()
    .arg("a")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("cycle"));
  assert!(!env.exists("a"));
  assert!(!env.exists("b"));
}

// =============================================================================
// S5: parallel independent targets
// =============================================================================

#[test]
fn s5_parallel_objects_all_build() {
  let mut knitfile = String::from("return r{\n[[\nall:V:");
  for i in 0..8 {
    knitfile.push_str(&format!(" f{}.o", i));
  }
  knitfile.push_str("\n]],\n[[\n%.o: %.c\n    cat $input > $output\n]],\n}\n");

  let env = TestEnv::new(&knitfile);
  for i in 0..8 {
    env.write(&format!("f{}.c", i), &format!("{}\n", i));
  }

  env.knit().args(["-j", "4", "all"]).assert().success();
  for i in 0..8 {
    assert!(env.exists(&format!("f{}.o", i)));
  }
}

// =============================================================================
// S6: keep-going
// =============================================================================

const TWO_TREES: &str = r#"
return r{
[[
all:V: a.out b.out
]],
[[
a.out: a.mid
    cat a.mid > a.out
]],
[[
a.mid:
    exit 1
]],
[[
b.out: b.mid
    cat b.mid > b.out
]],
[[
b.mid:
    echo b > b.mid
]],
}
"#;

#[test]
fn s6_keep_going_finishes_independent_subtree() {
  let env = TestEnv::new(TWO_TREES);
  env.knit().args(["--keep-going", "all"]).assert().code(1);

  assert!(env.exists("b.out"));
  assert!(!env.exists("a.out"));

  // The database kept B's progress: the next run does not rebuild it.
  env
    .knit()
    .args(["--keep-going", "all"])
    .assert()
    .code(1)
    .stdout(predicate::str::contains("b.mid").not());
}

#[test]
fn failure_without_keep_going_exits_one() {
  let env = TestEnv::new(TWO_TREES);
  env
    .knit()
    .arg("a.out")
    .assert()
    .code(1)
    .stderr(predicate::str::contains("a.mid"));
}

// =============================================================================
// Flags
// =============================================================================

#[test]
fn dry_run_prints_but_does_not_execute() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");

  env
    .knit()
    .args(["-n", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("cat hello.o > hello"));
  assert!(!env.exists("hello"));
  assert!(!env.exists("hello.o"));

  // The dry run recorded nothing: a real run still builds.
  env.knit().arg("hello").assert().success();
  assert!(env.exists("hello"));
}

#[test]
fn always_build_ignores_the_database() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().arg("hello").assert().success();

  env
    .knit()
    .args(["-B", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done").not());
}

#[test]
fn updated_override_forces_dependents() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().arg("hello").assert().success();
  let first_link = env.mtime("hello");

  std::thread::sleep(std::time::Duration::from_millis(20));
  env
    .knit()
    .args(["-u", "hello.o", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("nothing to be done").not());
  assert!(env.mtime("hello") > first_link);
}

#[test]
fn quiet_suppresses_recipe_echo() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env
    .knit()
    .args(["-q", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::is_empty());
}

#[test]
fn steps_style_counts_nodes() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env
    .knit()
    .args(["-s", "steps", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("[1/"));
}

#[test]
fn version_flag() {
  let env = TestEnv::new(COMPILE);
  env
    .knit()
    .arg("-v")
    .assert()
    .success()
    .stdout(predicate::str::contains("knit"));
}

#[test]
fn missing_knitfile_is_a_config_error() {
  let temp = TempDir::new().unwrap();
  let mut cmd = Command::cargo_bin("knit").unwrap();
  cmd.current_dir(temp.path());
  cmd.arg("x").assert().code(2).stderr(predicate::str::contains("knitfile"));
}

#[test]
fn missing_target_is_a_config_error() {
  let env = TestEnv::new(COMPILE);
  // No hello.c anywhere: %.c cannot be satisfied.
  env
    .knit()
    .arg("hello")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("hello.c"));
}

#[test]
fn capitalized_knitfile_is_preferred() {
  let env = TestEnv::new("return r{ [[\nwrong:V:\n    exit 1\n]] }");
  fs::write(
    env.path("Knitfile"),
    "return r{ [[\nok:\n    echo ok > ok\n]] }",
  )
  .unwrap();
  env.knit().assert().success();
  assert!(env.exists("ok"));
}

#[test]
fn knitfile_found_from_subdirectory() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  fs::create_dir(env.path("deep")).unwrap();

  let mut cmd = Command::cargo_bin("knit").unwrap();
  cmd.current_dir(env.path("deep"));
  cmd.assert().success();
  assert!(env.exists("hello"));
}

// =============================================================================
// Sub-rule sets
// =============================================================================

#[test]
fn included_rule_sets_build_in_their_directory() {
  let knitfile = r#"
local sub = include("sub/knitfile")
return r{
[[
all:V: sub/lib.o
]],
sub,
}
"#;
  let env = TestEnv::new(knitfile);
  fs::create_dir(env.path("sub")).unwrap();
  fs::write(
    env.path("sub/knitfile"),
    "return r{ [[\n%.o: %.c\n    cat $input > $output\n]] }",
  )
  .unwrap();
  env.write("sub/lib.c", "library\n");

  env.knit().arg("all").assert().success();
  assert_eq!(env.read("sub/lib.o"), "library\n");
}

// =============================================================================
// Tools
// =============================================================================

#[test]
fn tool_clean_removes_outputs() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().arg("hello").assert().success();
  assert!(env.exists("hello"));

  env.knit().args(["-t", "clean", "hello"]).assert().success();
  assert!(!env.exists("hello"));
  assert!(!env.exists("hello.o"));
  assert!(env.exists("hello.c"));
}

#[test]
fn tool_graph_emits_dot() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env
    .knit()
    .args(["-t", "graph", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("digraph build"))
    .stdout(predicate::str::contains("\"hello\" -> \"hello.o\""));
}

#[test]
fn tool_list_names_targets() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env
    .knit()
    .args(["-t", "list", "hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("hello.o"));
}

#[test]
fn tool_commands_writes_compile_commands() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env.knit().args(["-t", "commands", "hello"]).assert().success();

  let json = env.read("compile_commands.json");
  assert!(json.contains("hello.o"), "got {}", json);
  assert!(json.contains("cat"), "got {}", json);
}

#[test]
fn unknown_tool_is_a_config_error() {
  let env = TestEnv::new(COMPILE);
  env.write("hello.c", "body\n");
  env
    .knit()
    .args(["-t", "nope", "hello"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("unknown tool"));
}
