pub struct DefaultsConfig {
    pub workers: usize,
    pub points: u64,
    pub seed: u64,
    pub validate_points: bool,
    pub likelihood_purpose: String,
    pub invalid_loglike: f64,
    pub observable_purpose: String,
    pub prefer_model_specific_functions: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            points: 100,
            seed: 0,
            validate_points: true,
            likelihood_purpose: "LogLike".to_string(),
            invalid_loglike: -1.0e30,
            observable_purpose: "Observable".to_string(),
            prefer_model_specific_functions: true,
        }
    }
}
