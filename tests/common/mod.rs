/// Common test utilities shared by the integration tests
///
/// - `mock_backend`: scripted in-memory backend with failure injection
/// - `test_helpers`: settings and manager builders
pub mod mock_backend;
pub mod test_helpers;
