/*!
Persistence of chains and log-pdf evaluations.

Chains are written one CSV file per chain while the controller runs, and can be read back
exactly with [`csv::load_samples`].
*/

pub mod csv;
