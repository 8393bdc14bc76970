//! Fuzz target for tag filter compilation and application.
//!
//! Arbitrary tag specs must either compile or fail with a config error, and
//! a compiled filter must always yield a duplicate-free subsequence.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_mirror::{TagFilter, TagsSpec};
use std::collections::HashSet;

fuzz_target!(|data: (Vec<String>, Vec<String>)| {
    let (spec, tags) = data;

    // Should never panic
    let Ok(filter) = TagFilter::from_spec(Some(&TagsSpec::List(spec))) else {
        return;
    };
    let result = filter.apply(&tags);

    let mut seen = HashSet::new();
    assert!(result.iter().all(|t| seen.insert(t)));

    let mut rest = tags.iter();
    assert!(result.iter().all(|r| rest.any(|t| t == r)));
});
