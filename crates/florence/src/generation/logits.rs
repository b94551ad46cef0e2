use super::SearchParams;

/// Adjusts the next-token log-probabilities of one sequence in place.
pub trait LogitsProcessor: Send {
    fn process(&self, input_ids: &[u32], scores: &mut [f32]);
}

/// Bans tokens that would complete an n-gram already present in the sequence.
pub struct NoRepeatNGram {
    ngram_size: usize,
}

impl NoRepeatNGram {
    pub fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }

    pub fn banned_tokens(&self, input_ids: &[u32]) -> Vec<u32> {
        let n = self.ngram_size;
        if n == 0 || input_ids.len() + 1 < n {
            return vec![];
        }

        let prefix = &input_ids[input_ids.len() + 1 - n..];
        input_ids
            .windows(n)
            .filter(|ngram| &ngram[..n - 1] == prefix)
            .map(|ngram| ngram[n - 1])
            .collect()
    }
}

impl LogitsProcessor for NoRepeatNGram {
    fn process(&self, input_ids: &[u32], scores: &mut [f32]) {
        for token in self.banned_tokens(input_ids) {
            if let Some(score) = scores.get_mut(token as usize) {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

fn force_token(token_id: u32, scores: &mut [f32]) {
    for (idx, score) in scores.iter_mut().enumerate() {
        *score = if idx == token_id as usize {
            0.0
        } else {
            f32::NEG_INFINITY
        };
    }
}

/// Forces the first generated token.
pub struct ForcedBosToken {
    token_id: u32,
}

impl ForcedBosToken {
    pub fn new(token_id: u32) -> Self {
        Self { token_id }
    }
}

impl LogitsProcessor for ForcedBosToken {
    fn process(&self, input_ids: &[u32], scores: &mut [f32]) {
        if input_ids.len() == 1 {
            force_token(self.token_id, scores);
        }
    }
}

/// Forces the last token once `max_length` is about to be reached.
pub struct ForcedEosToken {
    token_id: u32,
    max_length: usize,
}

impl ForcedEosToken {
    pub fn new(token_id: u32, max_length: usize) -> Self {
        Self {
            token_id,
            max_length,
        }
    }
}

impl LogitsProcessor for ForcedEosToken {
    fn process(&self, input_ids: &[u32], scores: &mut [f32]) {
        if input_ids.len() + 1 == self.max_length {
            force_token(self.token_id, scores);
        }
    }
}

#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    pub fn from_params(params: &SearchParams) -> Self {
        let mut list = Self::default();

        if params.no_repeat_ngram_size > 0 {
            list.push(NoRepeatNGram::new(params.no_repeat_ngram_size));
        }
        if let Some(token_id) = params.forced_bos_token_id {
            list.push(ForcedBosToken::new(token_id));
        }
        if let Some(token_id) = params.forced_eos_token_id {
            list.push(ForcedEosToken::new(token_id, params.max_length));
        }

        list
    }

    pub fn push(&mut self, processor: impl LogitsProcessor + 'static) {
        self.processors.push(Box::new(processor));
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn process(&self, input_ids: &[u32], scores: &mut [f32]) {
        for processor in &self.processors {
            processor.process(input_ids, scores);
        }
    }
}
