//! Internal testing utilities for the mil-ir crates.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe, RefUnwindSafe, UnwindSafe};

/// Run table-driven tests.
///
/// Each case is run with panics caught, so a failing case does not hide
/// failures in later cases. Once every case has run, this panics with the
/// number of failed cases and their debug representations, if any failed.
///
/// ```
/// use mil_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     x: i32,
///     doubled: i32,
/// }
///
/// let cases = [Case { x: 2, doubled: 4 }, Case { x: -1, doubled: -2 }];
/// cases.test_each(|case| assert_eq!(case.x * 2, case.doubled));
/// ```
///
/// Case values and anything the test closure captures must be unwind safe.
/// Wrap fields in [`AssertUnwindSafe`] where that is not the case, or build
/// the non-unwind-safe value inside the closure.
pub trait TestCases {
    type Case;

    /// Run `test` with a reference to each case.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Run `test` with a clone of each case.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;

    /// Run `test` with each case by value. The debug representation is
    /// captured before the case is moved.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures(failures: &[String]) {
    if !failures.is_empty() {
        panic!(
            "{} test cases failed:\n{}",
            failures.len(),
            failures.join("\n")
        );
    }
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + RefUnwindSafe,
    {
        let failures: Vec<String> = self
            .into_iter()
            .filter(|case| catch_unwind(|| test(case)).is_err())
            .map(|case| format!("{:?}", case))
            .collect();
        report_failures(&failures);
    }

    fn test_each_clone(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + Clone + UnwindSafe,
    {
        let test = &test;
        let failures: Vec<String> = self
            .into_iter()
            .filter(|case| {
                let value = case.clone();
                catch_unwind(move || test(value)).is_err()
            })
            .map(|case| format!("{:?}", case))
            .collect();
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        I::Item: Debug + UnwindSafe,
    {
        let test = &test;
        let mut failures = Vec::new();
        for case in self {
            let desc = format!("{:?}", case);
            if catch_unwind(move || test(case)).is_err() {
                failures.push(desc);
            }
        }
        report_failures(&failures);
    }
}

/// Return true if `actual` is within `atol + rtol * |expected|` of
/// `expected`.
pub fn approx_eq(actual: f32, expected: f32, atol: f32, rtol: f32) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return actual.is_nan() && expected.is_nan();
    }
    if actual == expected {
        return true;
    }
    (actual - expected).abs() <= atol + rtol * expected.abs()
}

/// Assert that two float slices are element-wise close.
///
/// On failure the panic message lists up to 16 mismatched positions.
#[track_caller]
pub fn assert_close(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length {} does not match expected length {}",
        actual.len(),
        expected.len()
    );

    let mismatches: Vec<_> = actual
        .iter()
        .zip(expected)
        .enumerate()
        .filter(|(_, (&a, &e))| !approx_eq(a, e, atol, rtol))
        .collect();

    if !mismatches.is_empty() {
        let shown: Vec<String> = mismatches
            .iter()
            .take(16)
            .map(|(i, (a, e))| format!("[{}] {} != {}", i, a, e))
            .collect();
        panic!(
            "{} of {} values differ:\n{}",
            mismatches.len(),
            actual.len(),
            shown.join("\n")
        );
    }
}

/// Run `f` and return the panic message if it panicked.
pub fn panic_message<F: FnOnce()>(f: F) -> Option<String> {
    let err = catch_unwind(AssertUnwindSafe(f)).err()?;
    if let Some(msg) = err.downcast_ref::<&str>() {
        Some(msg.to_string())
    } else if let Some(msg) = err.downcast_ref::<String>() {
        Some(msg.clone())
    } else {
        Some(String::new())
    }
}
