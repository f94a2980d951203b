// Scenario tests spanning more than one module
// Unit tests live next to the code they cover

mod messages_tests;
mod support;
