//! Compiler argument adjusters.
//!
//! Backends report the arguments a file is *built* with. Semantic functionality and
//! indexing need different arguments: nothing may be emitted, analysis has to continue past
//! errors, and index data goes to a known store. The functions here rewrite build
//! arguments accordingly. They are pure; equal input yields equal output, and applying an
//! adjuster to its own output changes nothing.
//!
//! Removal uses a single left-to-right scan. At every position the longest matching option
//! name wins, so the order of the removal tables does not matter.

use keel_build_model::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dashes {
    Single,
    Double,
}

impl Dashes {
    fn prefix(self) -> &'static str {
        match self {
            Self::Single => "-",
            Self::Double => "--",
        }
    }
}

/// How an option's value is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    /// The option takes no value.
    None,
    /// `-MFpath` or `-MF path`.
    AttachedOrSeparate,
    /// `-o path` only.
    Separate,
    /// `-j4`, `-j 4` or `-output-file-map=path`.
    Any,
}

#[derive(Debug, Clone, Copy)]
struct CompilerOption {
    name: &'static str,
    dashes: Dashes,
    value: Value,
    /// A wrapper like `-Xfrontend` that must be removed together with the option.
    preceded_by: Option<&'static str>,
}

const fn flag(name: &'static str) -> CompilerOption {
    CompilerOption {
        name,
        dashes: Dashes::Single,
        value: Value::None,
        preceded_by: None,
    }
}

const fn with_value(name: &'static str, value: Value) -> CompilerOption {
    CompilerOption {
        name,
        dashes: Dashes::Single,
        value,
        preceded_by: None,
    }
}

const fn double_dash(name: &'static str, value: Value) -> CompilerOption {
    CompilerOption {
        name,
        dashes: Dashes::Double,
        value,
        preceded_by: None,
    }
}

const fn wrapped(wrapper: &'static str, name: &'static str) -> CompilerOption {
    CompilerOption {
        name,
        dashes: Dashes::Single,
        value: Value::None,
        preceded_by: Some(wrapper),
    }
}

/// What a match at one position removes.
struct Match {
    option: CompilerOption,
    /// Number of arguments consumed, starting at the matched position.
    consumed: usize,
    value: Option<String>,
}

impl CompilerOption {
    fn spelling_len(&self) -> usize {
        self.dashes.prefix().len() + self.name.len()
    }

    fn matches(&self, args: &[String], index: usize) -> Option<Match> {
        let argument = args.get(index)?;
        let rest = argument
            .strip_prefix(self.dashes.prefix())?
            .strip_prefix(self.name)?;
        let (consumed, value) = match (self.value, rest) {
            (Value::None, "") => (1, None),
            (Value::None, _) => return None,
            (Value::Separate | Value::AttachedOrSeparate | Value::Any, "") => {
                (2, args.get(index + 1).cloned())
            }
            (Value::Separate, _) => return None,
            (Value::AttachedOrSeparate, attached) => (1, Some(attached.to_string())),
            (Value::Any, attached) => {
                let attached = attached.strip_prefix('=').unwrap_or(attached);
                (1, Some(attached.to_string()))
            }
        };
        Some(Match {
            option: *self,
            consumed,
            value,
        })
    }
}

fn longest_match(options: &[CompilerOption], args: &[String], index: usize) -> Option<Match> {
    options
        .iter()
        .filter_map(|option| option.matches(args, index))
        .max_by_key(|found| found.option.spelling_len())
}

const OUTPUT: &str = "o";
const INDEX_UNIT_OUTPUT_PATH: &str = "-index-unit-output-path";

struct Stripped {
    arguments: Vec<String>,
    output_path: Option<String>,
}

fn strip(args: &[String], options: &[CompilerOption]) -> Stripped {
    let mut arguments: Vec<String> = Vec::with_capacity(args.len());
    let mut output_path = None;
    let mut index = 0;
    while index < args.len() {
        let Some(found) = longest_match(options, args, index) else {
            arguments.push(args[index].clone());
            index += 1;
            continue;
        };
        if let Some(wrapper) = found.option.preceded_by {
            let wrapped_here = index > 0 && args[index - 1] == wrapper;
            if !wrapped_here {
                arguments.push(args[index].clone());
                index += 1;
                continue;
            }
            if arguments.last().is_some_and(|last| last == wrapper) {
                arguments.pop();
            }
        }
        if found.option.name == OUTPUT && found.option.dashes == Dashes::Single {
            output_path = found.value;
        }
        index += found.consumed;
    }
    Stripped {
        arguments,
        output_path,
    }
}

fn finish(stripped: Stripped, appended: &[&str]) -> Vec<String> {
    let Stripped {
        mut arguments,
        output_path,
    } = stripped;
    arguments.extend(appended.iter().map(|arg| arg.to_string()));
    if let Some(output_path) = output_path {
        if !arguments.iter().any(|arg| arg == INDEX_UNIT_OUTPUT_PATH) {
            arguments.push(INDEX_UNIT_OUTPUT_PATH.to_string());
            arguments.push(output_path);
        }
    }
    arguments
}

const SWIFT_REMOVED: &[CompilerOption] = &[
    flag("c"),
    flag("disable-cmo"),
    flag("emit-dependencies"),
    flag("emit-library"),
    flag("emit-module"),
    flag("emit-module-interface"),
    with_value("emit-module-interface-path", Value::Separate),
    with_value("emit-module-path", Value::Separate),
    flag("emit-objc-header"),
    with_value("emit-objc-header-path", Value::Separate),
    with_value("emit-private-module-interface-path", Value::Separate),
    with_value("emit-const-values-path", Value::Separate),
    flag("enable-batch-mode"),
    flag("incremental"),
    with_value("index-store-path", Value::Separate),
    with_value("j", Value::Any),
    with_value("num-threads", Value::Separate),
    with_value(OUTPUT, Value::Separate),
    with_value("output-file-map", Value::Any),
    flag("parseable-output"),
    flag("save-temps"),
    flag("serialize-diagnostics"),
    with_value("serialize-diagnostics-path", Value::Separate),
    flag("typecheck"),
    flag("whole-module-optimization"),
    flag("wmo"),
    wrapped("-Xfrontend", "experimental-skip-all-function-bodies"),
    wrapped("-Xfrontend", "experimental-skip-non-inlinable-function-bodies"),
    wrapped("-Xfrontend", "experimental-skip-non-inlinable-function-bodies-without-types"),
    wrapped("-Xfrontend", "experimental-allow-module-with-compiler-errors"),
];

const CLANG_REMOVED: &[CompilerOption] = &[
    flag("M"),
    flag("MM"),
    flag("MD"),
    flag("MMD"),
    flag("MG"),
    flag("MP"),
    flag("MV"),
    with_value("MF", Value::AttachedOrSeparate),
    with_value("MT", Value::AttachedOrSeparate),
    with_value("MQ", Value::AttachedOrSeparate),
    with_value("MJ", Value::AttachedOrSeparate),
    double_dash("serialize-diagnostics", Value::Separate),
    with_value("serialize-diagnostics", Value::Separate),
    flag("c"),
    with_value(OUTPUT, Value::AttachedOrSeparate),
    with_value("index-store-path", Value::Separate),
    flag("fsyntax-only"),
    flag("fretain-comments-from-system-headers"),
    wrapped("-Xclang", "detailed-preprocessing-record"),
];

const SWIFT_SEMANTIC_APPENDED: &[&str] = &[
    "-typecheck",
    "-Xfrontend",
    "-experimental-allow-module-with-compiler-errors",
];

const CLANG_SEMANTIC_APPENDED: &[&str] = &[
    "-fsyntax-only",
    "-fretain-comments-from-system-headers",
    "-Xclang",
    "-detailed-preprocessing-record",
];

/// Swift arguments for type checking without emitting anything.
pub fn swift_for_semantic_functionality(args: &[String]) -> Vec<String> {
    finish(strip(args, SWIFT_REMOVED), SWIFT_SEMANTIC_APPENDED)
}

/// Clang arguments for syntax/semantic analysis that keeps the documentation comments and
/// preprocessing records editor features need.
pub fn clang_for_semantic_functionality(args: &[String]) -> Vec<String> {
    finish(strip(args, CLANG_REMOVED), CLANG_SEMANTIC_APPENDED)
}

/// Swift arguments for an indexing pass writing to `index_store_path`.
pub fn swift_for_indexing(args: &[String], index_store_path: &str) -> Vec<String> {
    let appended = [
        "-typecheck",
        "-index-store-path",
        index_store_path,
        "-Xfrontend",
        "-experimental-allow-module-with-compiler-errors",
    ];
    finish(strip(args, SWIFT_REMOVED), &appended)
}

/// Clang arguments for an indexing pass writing to `index_store_path`.
pub fn clang_for_indexing(args: &[String], index_store_path: &str) -> Vec<String> {
    let appended = ["-fsyntax-only", "-index-store-path", index_store_path];
    finish(strip(args, CLANG_REMOVED), &appended)
}

pub fn for_semantic_functionality(language: Language, args: &[String]) -> Vec<String> {
    if language.is_clang_family() {
        clang_for_semantic_functionality(args)
    } else {
        swift_for_semantic_functionality(args)
    }
}

pub fn for_indexing(language: Language, args: &[String], index_store_path: &str) -> Vec<String> {
    if language.is_clang_family() {
        clang_for_indexing(args, index_store_path)
    } else {
        swift_for_indexing(args, index_store_path)
    }
}
