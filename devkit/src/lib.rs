/*!
# dfstat DevKit - stubs and helpers for testing the daemon and the relay

Test-only library shared by `dfstat-kernel` and `dfstat-relay`:
- `df -P` report builder producing the exact text a remote host prints
- Mock notification relay listening on a real TCP port and recording frames
- Temporary workspace writing config / inventory files
*/

pub mod df_fixture;
pub mod relay_stub;
pub mod test_utils;

pub use df_fixture::DfReportBuilder;
pub use relay_stub::{MockRelay, RelayFrame};
pub use test_utils::TestWorkspace;
