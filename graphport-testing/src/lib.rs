//! Internal testing utilities for the graphport crates.

use std::fmt::Debug;
use std::panic::{catch_unwind, RefUnwindSafe, UnwindSafe};

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// To create a table driven test:
///
/// 1. Import the `TestCases` trait
/// 2. Create a struct, conventionally named `Case`, that contains the data
///    for a single test case. This struct must implement `Debug`.
/// 3. Create a collection of `Case` instances, conventionally named `cases`.
/// 4. Call `cases.test_each`, passing the test function as a closure
///
/// `test_each` runs every case and catches panics. If all cases succeed it
/// returns, otherwise it panics with a message listing the failing cases.
///
/// ## Example
///
/// ```
/// use graphport_testing::TestCases;
///
/// // Add #[test] attribute
/// fn test_multiply() {
///   #[derive(Debug)]
///   struct Case {
///     a: i32,
///     b: i32,
///     expected: i32,
///   }
///
///   let cases = [
///     Case { a: 3, b: 5, expected: 15 },
///   ];
///
///   cases.test_each(|&Case { a, b, expected }| {
///     assert_eq!(a * b, expected);
///   });
/// }
/// # test_multiply();
/// ```
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call test function `test` with each test case in `self`, catching any
    /// panics.
    ///
    /// After all cases have been evaluated, return if no panics occurred or
    /// panic with details of failing cases otherwise.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes a clone of
    /// each test case to the test function, rather than a reference.
    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe;
}

fn run_cases<C: Debug>(
    cases: impl IntoIterator<Item = C>,
    run: impl Fn(&C) -> Result<(), Box<dyn std::any::Any + Send>>,
) {
    let mut failures = Vec::new();
    let mut total = 0;

    for case in cases {
        total += 1;
        if run(&case).is_err() {
            failures.push(format!("{:?}", case));
        }
    }

    if !failures.is_empty() {
        panic!(
            "{} of {} test cases failed:\n{}",
            failures.len(),
            total,
            failures.join("\n")
        );
    }
}

impl<C> TestCases for Vec<C> {
    type Case = C;

    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        run_cases(self, |case| catch_unwind(|| test(case)));
    }

    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe,
    {
        run_cases(self, |case| {
            let case = case.clone();
            let test = &test;
            catch_unwind(move || test(case))
        });
    }
}

impl<C, const N: usize> TestCases for [C; N] {
    type Case = C;

    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        run_cases(self, |case| catch_unwind(|| test(case)));
    }

    fn test_each_clone(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + Clone + UnwindSafe,
    {
        run_cases(self, |case| {
            let case = case.clone();
            let test = &test;
            catch_unwind(move || test(case))
        });
    }
}
