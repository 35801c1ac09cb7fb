//! Integration suite for the resilience layer.

mod circuit_transitions;
mod fallback_scenarios;
mod support;
