//! Command synthesizers: pure functions producing a self-contained `node -e "..."`
//! command for each file operation.
//!
//! Every caller-provided string (paths, patterns, file content, search and replace
//! strings) is base64-encoded here and decoded by the script on startup. Nothing the
//! caller sends is ever spliced into script or shell syntax directly, so quoting and
//! injection are not a concern for the executing shell. Numeric arguments are clamped
//! before they are written into the script source.
//!
//! Listing and search scripts print one JSON object per line; the edit script reports
//! its outcome through the exit code (see [EDIT_EXIT_NOT_FOUND] and friends).
//!
//! The execution target needs Node.js 20+ on its `PATH`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::glob::glob_to_regex;

/// Largest integer a script can hold exactly (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Printed by the read script for a zero-byte file.
pub const EMPTY_FILE_REMINDER: &str = "System reminder: File exists but has empty contents";

/// Printed by the grep script when the pattern does not compile.
pub const INVALID_REGEX_MARKER: &str = "Invalid regex:";

/// Edit exit code: the old string does not occur in the file.
pub const EDIT_EXIT_NOT_FOUND: i32 = 1;
/// Edit exit code: more than one occurrence and `replace_all` is off.
pub const EDIT_EXIT_AMBIGUOUS: i32 = 2;
/// Edit exit code: the file is missing or unreadable.
pub const EDIT_EXIT_FILE_MISSING: i32 = 3;

/// Write exit code: the target path already exists.
pub const WRITE_EXIT_EXISTS: i32 = 1;
/// Printed by the write script alongside [WRITE_EXIT_EXISTS].
pub const FILE_EXISTS_MARKER: &str = "File already exists";

const PRELUDE: &str = "
const fs = require('fs');
const path = require('path');
const dec = (s) => Buffer.from(s, 'base64').toString('utf-8');
";

const LS_TEMPLATE: &str = "
const dirPath = dec('@PATH@');

try {
  const entries = fs.readdirSync(dirPath, { withFileTypes: true });
  for (const entry of entries) {
    const fullPath = path.join(dirPath, entry.name);
    let stat;
    try {
      stat = fs.statSync(fullPath);
    } catch (e) {
      continue;
    }
    const isDir = stat.isDirectory();
    console.log(JSON.stringify({
      path: isDir ? fullPath + '/' : fullPath,
      size: stat.size,
      mtime: stat.mtimeMs,
      isDir: isDir
    }));
  }
} catch (e) {
  console.error('Error: ' + e.message);
  process.exit(1);
}
";

const READ_TEMPLATE: &str = "
const filePath = dec('@PATH@');
const offset = @OFFSET@;
const limit = @LIMIT@;

let stat;
try {
  stat = fs.statSync(filePath);
} catch (e) {
  console.log('Error: File not found');
  process.exit(1);
}
if (!stat.isFile()) {
  console.log('Error: Not a regular file');
  process.exit(1);
}
if (stat.size === 0) {
  console.log('@EMPTY@');
  process.exit(0);
}

const lines = fs.readFileSync(filePath, 'utf-8').split('\\n');
if (lines.length > 1 && lines[lines.length - 1] === '') {
  lines.pop();
}
const selected = lines.slice(offset, offset + limit);
const out = [];
for (let i = 0; i < selected.length; i++) {
  out.push(String(offset + i + 1).padStart(6) + '\\t' + selected[i]);
}
if (out.length > 0) {
  process.stdout.write(out.join('\\n') + '\\n');
}
";

const WRITE_TEMPLATE: &str = "
const filePath = dec('@PATH@');
const content = dec('@CONTENT@');

try {
  fs.mkdirSync(path.dirname(filePath) || '.', { recursive: true });
} catch (e) {
  console.error('Error: ' + e.message);
  process.exit(2);
}
try {
  fs.writeFileSync(filePath, content, { encoding: 'utf-8', flag: 'wx' });
} catch (e) {
  if (e.code === 'EEXIST') {
    console.error('Error: @EXISTS@');
    process.exit(1);
  }
  console.error('Error: ' + e.message);
  process.exit(2);
}
console.log('OK');
";

const EDIT_TEMPLATE: &str = "
const filePath = dec('@PATH@');
const oldStr = dec('@OLD@');
const newStr = dec('@NEW@');
const replaceAll = @REPLACE_ALL@;

let text;
try {
  text = fs.readFileSync(filePath, 'utf-8');
} catch (e) {
  process.exit(3);
}
if (oldStr.length === 0) {
  process.exit(1);
}

const parts = text.split(oldStr);
const count = parts.length - 1;
if (count === 0) {
  process.exit(1);
}
if (count > 1 && !replaceAll) {
  process.exit(2);
}

try {
  fs.writeFileSync(filePath, parts.join(newStr), 'utf-8');
} catch (e) {
  console.error('Error: ' + e.message);
  process.exit(4);
}
console.log(count);
";

const GREP_TEMPLATE: &str = "
const searchPath = dec('@PATH@');
const globSource = @GLOB@;

let regex;
try {
  regex = new RegExp(dec('@PATTERN@'));
} catch (e) {
  console.log('@INVALID@ ' + e.message);
  process.exit(1);
}

let globRegex = null;
if (globSource !== null) {
  try {
    globRegex = new RegExp(globSource);
  } catch (e) {
    process.exit(0);
  }
}

function visit(file, rel) {
  if (globRegex !== null && !globRegex.test(rel)) {
    return;
  }
  let content;
  try {
    content = fs.readFileSync(file, 'utf-8');
  } catch (e) {
    return;
  }
  const lines = content.split('\\n');
  for (let i = 0; i < lines.length; i++) {
    if (regex.test(lines[i])) {
      console.log(JSON.stringify({ path: file, line: i + 1, text: lines[i] }));
    }
  }
}

function walk(dir) {
  let entries;
  try {
    entries = fs.readdirSync(dir, { withFileTypes: true });
  } catch (e) {
    return;
  }
  for (const entry of entries) {
    const full = path.join(dir, entry.name);
    if (entry.isDirectory()) {
      walk(full);
    } else {
      visit(full, path.relative(searchPath, full));
    }
  }
}

let root = null;
try {
  root = fs.statSync(searchPath);
} catch (e) {
  root = null;
}
if (root !== null && root.isDirectory()) {
  walk(searchPath);
} else if (root !== null) {
  visit(searchPath, path.basename(searchPath));
}
";

const GLOB_TEMPLATE: &str = "
const searchPath = dec('@PATH@');

let globRegex;
try {
  globRegex = new RegExp(dec('@GLOB@'));
} catch (e) {
  process.exit(1);
}

function walk(dir) {
  let entries;
  try {
    entries = fs.readdirSync(dir, { withFileTypes: true });
  } catch (e) {
    return;
  }
  for (const entry of entries) {
    const full = path.join(dir, entry.name);
    if (entry.isDirectory()) {
      walk(full);
      continue;
    }
    if (!globRegex.test(path.relative(searchPath, full))) {
      continue;
    }
    let stat;
    try {
      stat = fs.statSync(full);
    } catch (e) {
      continue;
    }
    console.log(JSON.stringify({
      path: full,
      size: stat.size,
      mtime: stat.mtimeMs,
      isDir: false
    }));
  }
}

walk(searchPath);
";

/// Standard base64 of the UTF-8 bytes of `value`.
pub fn encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Clamp a count to what the script can represent exactly.
pub fn safe_integer(value: usize) -> u64 {
    (value as u64).min(MAX_SAFE_INTEGER)
}

/// Wrap a script body into a single shell command.
///
/// Bodies are assembled from the templates above plus base64 text, numbers and
/// booleans, none of which contain `"`, `$` or a backtick.
fn node_command(body: &str) -> String {
    debug_assert!(
        !body.contains(['"', '$', '`']),
        "script body must not contain shell-active characters"
    );
    format!("node -e \"{}{}\"", PRELUDE, body)
}

/// List the direct children of `dir`.
pub fn build_ls_command(dir: &str) -> String {
    node_command(&LS_TEMPLATE.replace("@PATH@", &encode(dir)))
}

/// Read `limit` lines of `file_path` starting at the 0-indexed line `offset`.
pub fn build_read_command(file_path: &str, offset: usize, limit: usize) -> String {
    node_command(
        &READ_TEMPLATE
            .replace("@PATH@", &encode(file_path))
            .replace("@OFFSET@", &safe_integer(offset).to_string())
            .replace("@LIMIT@", &safe_integer(limit).to_string())
            .replace("@EMPTY@", EMPTY_FILE_REMINDER),
    )
}

/// Create `file_path` with `content`; fails if it exists.
pub fn build_write_command(file_path: &str, content: &str) -> String {
    node_command(
        &WRITE_TEMPLATE
            .replace("@PATH@", &encode(file_path))
            .replace("@CONTENT@", &encode(content))
            .replace("@EXISTS@", FILE_EXISTS_MARKER),
    )
}

/// Replace `old_str` with `new_str` in `file_path`.
pub fn build_edit_command(
    file_path: &str,
    old_str: &str,
    new_str: &str,
    replace_all: bool,
) -> String {
    node_command(
        &EDIT_TEMPLATE
            .replace("@PATH@", &encode(file_path))
            .replace("@OLD@", &encode(old_str))
            .replace("@NEW@", &encode(new_str))
            .replace("@REPLACE_ALL@", if replace_all { "true" } else { "false" }),
    )
}

/// Search files under `search_path` for lines matching the regex `pattern`.
pub fn build_grep_command(pattern: &str, search_path: &str, glob: Option<&str>) -> String {
    let glob_source = match glob {
        Some(g) => format!("dec('{}')", encode(&glob_to_regex(g))),
        None => "null".to_string(),
    };
    node_command(
        &GREP_TEMPLATE
            .replace("@PATH@", &encode(search_path))
            .replace("@GLOB@", &glob_source)
            .replace("@PATTERN@", &encode(pattern))
            .replace("@INVALID@", INVALID_REGEX_MARKER),
    )
}

/// Find files under `search_path` whose relative path matches the glob `pattern`.
pub fn build_glob_command(search_path: &str, pattern: &str) -> String {
    node_command(
        &GLOB_TEMPLATE
            .replace("@PATH@", &encode(search_path))
            .replace("@GLOB@", &encode(&glob_to_regex(pattern))),
    )
}
