// Test modules

mod serde_contract_test;
