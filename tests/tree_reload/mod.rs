mod service_registry_test;
