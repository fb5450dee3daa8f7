mod support;

mod fanout_tests;
mod identity_tests;
