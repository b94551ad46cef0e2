use super::SearchParams;

pub trait StoppingCriterion: Send {
    fn should_stop(&self, input_ids: &[u32]) -> bool;
}

pub struct MaxLength {
    max_length: usize,
}

impl MaxLength {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl StoppingCriterion for MaxLength {
    fn should_stop(&self, input_ids: &[u32]) -> bool {
        input_ids.len() >= self.max_length
    }
}

/// Stops once eos is generated. The decoder start token does not count, since
/// BART style models start decoding from eos.
pub struct EosToken {
    eos_token_id: u32,
}

impl EosToken {
    pub fn new(eos_token_id: u32) -> Self {
        Self { eos_token_id }
    }
}

impl StoppingCriterion for EosToken {
    fn should_stop(&self, input_ids: &[u32]) -> bool {
        input_ids.len() > 1 && input_ids.last() == Some(&self.eos_token_id)
    }
}

/// Stops when any criterion does.
#[derive(Default)]
pub struct StoppingCriteria {
    criteria: Vec<Box<dyn StoppingCriterion>>,
}

impl StoppingCriteria {
    pub fn from_params(params: &SearchParams) -> Self {
        let mut criteria = Self::default();
        criteria.push(MaxLength::new(params.max_length));
        criteria.push(EosToken::new(params.eos_token_id));
        criteria
    }

    pub fn push(&mut self, criterion: impl StoppingCriterion + 'static) {
        self.criteria.push(Box::new(criterion));
    }

    pub fn should_stop(&self, input_ids: &[u32]) -> bool {
        self.criteria.iter().any(|c| c.should_stop(input_ids))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generation::test::test_params;

    #[test]
    fn test_max_length() {
        let criterion = MaxLength::new(3);
        assert!(!criterion.should_stop(&[2, 0]));
        assert!(criterion.should_stop(&[2, 0, 5]));
    }

    #[test]
    fn test_eos_ignores_start_token() {
        let criterion = EosToken::new(2);
        assert!(!criterion.should_stop(&[2]));
        assert!(!criterion.should_stop(&[2, 0, 2, 5]));
        assert!(criterion.should_stop(&[2, 0, 2]));
    }

    #[test]
    fn test_criteria_stop_on_any() {
        let criteria = StoppingCriteria::from_params(&test_params(1));
        assert!(!criteria.should_stop(&[2, 0, 5]));
        assert!(criteria.should_stop(&[2, 0, 5, 2]));
        assert!(criteria.should_stop(&[2, 0, 5, 5, 5, 5, 5, 5, 5, 5]));
        assert!(!StoppingCriteria::default().should_stop(&[2]));
    }
}
