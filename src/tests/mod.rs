//! Pipeline test suite
//!
//! `mock_data` holds a deterministic whitespace tokenizer and fixture helpers
//! shared by the unit tests of every module. The remaining modules exercise
//! the pipeline across module boundaries.


mod pipeline_tests;
