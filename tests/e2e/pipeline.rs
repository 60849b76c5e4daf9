#![cfg(unix)]

use crate::e2e::*;

/// Common prologue of the fake tools: fail on request, pick out -c, -o, -MF
/// and -I, and log the call to tools.log in the working root.
const PROLOGUE: &str = r#"#!/bin/sh
name=$(basename "$0")
if [ -f "fail_$name" ]; then
  echo "$name: undefined reference to app_main" >&2
  exit 1
fi
out=
src=
depfile=
incs=
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -c) src="$2"; shift 2 ;;
    -MF) depfile="$2"; shift 2 ;;
    -I*) incs="$incs ${1#-I}"; shift ;;
    *) shift ;;
  esac
done
echo "$name $src" >> tools.log
"#;

/// Writes "<tool> <source>" to the output, and a depfile listing the
/// quoted includes found in the include directories.
const COMPILE: &str = r#"echo "$name $src" > "$out"
if [ -n "$depfile" ]; then
  deps="$src"
  for h in $(sed -n 's/^#include "\(.*\)"$/\1/p' "$src"); do
    for d in $incs; do
      if [ -f "$d/$h" ]; then deps="$deps $d/$h"; fi
    done
  done
  echo "$out: $deps" > "$depfile"
fi
"#;

/// Writes a unit test binary: runner.sh if present, else a passing one.
const LINK: &str = r#"if [ -f runner.sh ]; then
  cat runner.sh > "$out"
else
  printf '#!/bin/sh\necho "1 Tests 0 Failures"\n' > "$out"
fi
"#;

const PARTITION: &str = r#"#!/bin/sh
echo "part" >> tools.log
cp "$1" "$2"
"#;

const CONFIG: &str = r#"
[helpers]
c-compiler = "tools/cc"
linker = "tools/ld"
image-tool = "tools/img"
partition-tool = "tools/part"
flash-tool = "tools/flash"

[[firmware.sources]]
dir = "src"

[partition]
layout = "partitions.csv"

[flash]
bootloader = "sdk/bootloader.bin"
boot_app = "sdk/boot_app0.bin"

[test]
sources = [{ dir = "test" }]
helpers = { c-compiler = "tools/hostcc", linker = "tools/hostld" }
"#;

fn setup(config: &str) -> anyhow::Result<TestSpace> {
    let space = TestSpace::new()?;
    for name in ["cc", "hostcc", "img"] {
        space.write_script(&format!("tools/{}", name), &[PROLOGUE, COMPILE].concat())?;
    }
    for name in ["ld", "hostld"] {
        space.write_script(&format!("tools/{}", name), &[PROLOGUE, LINK].concat())?;
    }
    space.write_script("tools/flash", PROLOGUE)?;
    space.write_script("tools/part", PARTITION)?;
    space.write("xforge.toml", config)?;
    space.write("src/main.c", "int main() {}\n")?;
    space.write("src/clock.c", "int clock() {}\n")?;
    space.write("test/test_clock.c", "void test_clock() {}\n")?;
    space.write("partitions.csv", "nvs, data, nvs, 0x9000, 0x5000\n")?;
    space.write("sdk/bootloader.bin", "boot")?;
    space.write("sdk/boot_app0.bin", "app0")?;
    Ok(space)
}

/// Move a file's modification time forward, past any filesystem granularity.
fn bump_mtime(space: &TestSpace, path: &str) -> anyhow::Result<()> {
    let path = space.path(path);
    let now = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path)?);
    let later = filetime::FileTime::from_unix_time(now.unix_seconds() + 10, 0);
    filetime::set_file_mtime(path, later)?;
    Ok(())
}

fn log_lines(space: &TestSpace) -> Vec<String> {
    space
        .read("tools.log")
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn full_pipeline_then_no_work() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    let out = space.run_expect(&mut xforge_command(vec![]))?;
    assert_output_contains(&out, "xforge: ran 9 tasks, now up to date");

    assert_eq!(space.read("build/firmware/src/clock.c.o")?, "cc src/clock.c\n");
    assert_eq!(
        space.read("build/test/test/test_clock.c.o")?,
        "hostcc test/test_clock.c\n"
    );
    assert!(space.exists("dist/firmware.bin"));
    assert_eq!(
        space.read("dist/firmware.partitions.bin")?,
        space.read("partitions.csv")?
    );
    let log = log_lines(&space);
    assert_eq!(log.iter().filter(|l| l.starts_with("flash")).count(), 1);
    assert_eq!(
        space.read("build/test/unity_test.report")?,
        "1 Tests 0 Failures\nxforge: tests passed\n"
    );

    let out = space.run_expect(&mut xforge_command(vec![]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "xforge: no work to do\n");
    assert_eq!(log_lines(&space), log);
    Ok(())
}

#[test]
fn only_the_changed_source_recompiles() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    space.run_expect(&mut xforge_command(vec![]))?;
    std::fs::remove_file(space.path("tools.log"))?;

    bump_mtime(&space, "src/clock.c")?;
    space.run_expect(&mut xforge_command(vec![]))?;

    let log = log_lines(&space);
    let compiles: Vec<&String> = log.iter().filter(|l| l.contains("cc ")).collect();
    assert_eq!(compiles, vec!["cc src/clock.c"]);
    // Relinked, reconverted and reflashed; the test branch is untouched.
    assert!(log.iter().any(|l| l.starts_with("ld")));
    assert!(log.iter().any(|l| l.starts_with("flash")));
    assert!(!log.iter().any(|l| l.starts_with("host") || l == "part"));
    Ok(())
}

#[test]
fn header_edit_recompiles_its_includers() -> anyhow::Result<()> {
    let config = CONFIG.replace("dir = \"src\"\n", "dir = \"src\"\ninclude_dirs = [\"inc\"]\n");
    let space = setup(&config)?;
    space.write("inc/clock.h", "int clock();\n")?;
    space.write("src/clock.c", "#include \"clock.h\"\nint clock() {}\n")?;
    space.run_expect(&mut xforge_command(vec![]))?;
    std::fs::remove_file(space.path("tools.log"))?;

    space.write("inc/clock.h", "long clock();\n")?;
    bump_mtime(&space, "inc/clock.h")?;
    space.run_expect(&mut xforge_command(vec![]))?;

    let log = log_lines(&space);
    let compiles: Vec<&String> = log.iter().filter(|l| l.contains("cc ")).collect();
    assert_eq!(compiles, vec!["cc src/clock.c"]);
    assert!(log.iter().any(|l| l.starts_with("flash")));
    // Depfiles are read and removed with their run.
    for entry in std::fs::read_dir(space.path("build/firmware/src"))? {
        let name = entry?.file_name();
        assert!(!name.to_string_lossy().starts_with(".xforge-"), "{:?}", name);
    }

    let out = space.run_expect(&mut xforge_command(vec![]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "xforge: no work to do\n");
    Ok(())
}

#[test]
fn link_failure_skips_flash() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    space.write("fail_ld", "")?;
    let out = space.run(&mut xforge_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "failed: link dist/firmware");
    assert_output_contains(&out, "ld: undefined reference to app_main");

    assert!(!space.exists("dist/firmware"));
    assert!(!log_lines(&space).iter().any(|l| l.starts_with("flash")));
    for entry in std::fs::read_dir(space.path("dist"))? {
        let name = entry?.file_name();
        assert!(!name.to_string_lossy().starts_with(".xforge-"), "{:?}", name);
    }
    // The test branch is independent and still ran.
    assert!(space.exists("build/test/unity_test.report"));

    // Fixing the link picks up where the build stopped.
    std::fs::remove_file(space.path("fail_ld"))?;
    std::fs::remove_file(space.path("tools.log"))?;
    space.run_expect(&mut xforge_command(vec![]))?;
    let log = log_lines(&space);
    assert!(!log.iter().any(|l| l.starts_with("cc ")));
    assert!(log.iter().any(|l| l.starts_with("flash")));
    Ok(())
}

const FAILING_RUNNER: &str = "#!/bin/sh\necho \"1 Tests 1 Failures\"\nexit 1\n";

#[test]
fn failing_tests_fail_the_build() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    space.write("runner.sh", FAILING_RUNNER)?;
    let out = space.run(&mut xforge_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "1 Tests 1 Failures");
    assert!(!space.exists("build/test/unity_test.report"));
    // Firmware is unaffected.
    assert!(space.exists("dist/firmware.bin"));
    Ok(())
}

#[test]
fn failing_tests_reported_only() -> anyhow::Result<()> {
    let config = format!("{}on_failure = \"report_only\"\n", CONFIG);
    let space = setup(&config)?;
    space.write("runner.sh", FAILING_RUNNER)?;
    space.run_expect(&mut xforge_command(vec![]))?;
    assert_eq!(
        space.read("build/test/unity_test.report")?,
        "1 Tests 1 Failures\nxforge: tests failed with exit status 1\n"
    );

    // Still failing, so the next build runs them again and nothing else.
    let out = space.run_expect(&mut xforge_command(vec![]))?;
    assert_output_contains(&out, "xforge: ran 1 tasks");
    Ok(())
}

#[test]
fn no_test_skips_the_test_branch() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    space.run_expect(&mut xforge_command(vec!["--no-test"]))?;
    assert!(space.exists("dist/firmware.bin"));
    assert!(!space.exists("build/test"));
    Ok(())
}

#[test]
fn missing_prebuilt_image_fails_before_running() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    std::fs::remove_file(space.path("sdk/boot_app0.bin"))?;
    let out = space.run(&mut xforge_command(vec![]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "xforge: error:");
    assert_output_contains(&out, "sdk/boot_app0.bin");
    assert!(!space.exists("tools.log"));
    Ok(())
}

#[test]
fn compdb_and_clean() -> anyhow::Result<()> {
    let space = setup(CONFIG)?;
    let out = space.run_expect(&mut xforge_command(vec!["-t", "compdb"]))?;
    assert_output_contains(&out, "wrote 3 entries");
    let db: serde_json::Value = serde_json::from_str(&space.read("compile_commands.json")?)?;
    assert_eq!(db.as_array().map(Vec::len), Some(3));

    space.run_expect(&mut xforge_command(vec![]))?;
    let out = space.run_expect(&mut xforge_command(vec!["-t", "clean"]))?;
    assert_output_contains(&out, "xforge: removed");
    assert!(!space.exists("dist/firmware.bin"));
    assert!(!space.exists("build/.xforge_db"));
    assert!(space.exists("src/clock.c"));
    Ok(())
}
