//! Lifecycle extensions run around suites and tests.

use crate::error::RunError;
use crate::report::TestReport;
use crate::testcase::TestInfo;
use testrig_fixture::Fixture;

/// A stateful extension bound to one job's fixture and report.
///
/// Callbacks run on the test-driving thread, in registration order.  A
/// non-fatal [`RunError::TestFailure`] is recorded and the run may
/// continue; any other error aborts it.
pub trait Hook: Send {
    /// Registry name, also the suffix of the dynamic tests it injects.
    fn name(&self) -> &str;

    fn before_suite(
        &mut self,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        Ok(())
    }

    fn after_suite(
        &mut self,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        Ok(())
    }

    fn before_test(
        &mut self,
        _test: &TestInfo,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        Ok(())
    }

    fn after_test(
        &mut self,
        _test: &TestInfo,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        Ok(())
    }
}
