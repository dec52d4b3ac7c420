
#[cfg(test)]
pub mod link_tests;

#[cfg(test)]
pub mod node_state_tests;

#[cfg(test)]
pub mod supervisor_tests;


#[cfg(test)]
pub mod controller_tests;

#[cfg(test)]
pub mod session_tests;
