#[cfg(test)]
mod membus_tests;
