// Prompt templates for debate agents.
//
// Each agent type maps to a persona that argues one side of the committee
// debate about a ticker. Unknown agent types fall back to a neutral analyst
// so a new slug never fails at the prompt stage.

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

/// Role description for one agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persona {
    pub agent_type: &'static str,
    pub role: &'static str,
    pub focus: &'static str,
}

const PERSONAS: &[Persona] = &[
    Persona {
        agent_type: "contrarian",
        role: "the committee's contrarian",
        focus: "Challenge the prevailing view. Find what the consensus is missing, where \
                positioning is crowded, and which assumptions would break the thesis.",
    },
    Persona {
        agent_type: "bull",
        role: "the bull-case advocate",
        focus: "Make the strongest honest case for owning the stock: growth drivers, \
                competitive position, catalysts and upside scenarios.",
    },
    Persona {
        agent_type: "bear",
        role: "the bear-case advocate",
        focus: "Make the strongest honest case against owning the stock: downside risks, \
                valuation stretch, competitive threats and deteriorating fundamentals.",
    },
    Persona {
        agent_type: "risk_manager",
        role: "the risk manager",
        focus: "Assess position sizing, drawdown scenarios, liquidity, correlation with \
                the existing book and what would trigger an exit.",
    },
    Persona {
        agent_type: "quant",
        role: "the quantitative analyst",
        focus: "Focus on measurable signals: valuation multiples versus history and peers, \
                earnings revisions, momentum and factor exposures.",
    },
    Persona {
        agent_type: "macro",
        role: "the macro strategist",
        focus: "Place the name in the macro picture: rates, currency, commodity inputs, \
                sector rotation and policy risk.",
    },
];

const GENERIC_PERSONA: Persona = Persona {
    agent_type: "analyst",
    role: "an independent equity analyst",
    focus: "Weigh the bull and bear cases evenly and state which one the evidence favors.",
};

/// Persona for `agent_type`, or the generic analyst.
pub fn persona_for(agent_type: &str) -> &'static Persona {
    PERSONAS
        .iter()
        .find(|p| p.agent_type == agent_type)
        .unwrap_or(&GENERIC_PERSONA)
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// System prompt shared by every debate agent call.
pub fn system_prompt(agent_type: &str) -> String {
    let persona = persona_for(agent_type);
    format!(
        "You are {role} on an investment committee debating a single stock.\n\
         \n\
         {focus}\n\
         \n\
         Respond with a single JSON object and nothing else:\n\
         {{\"stance\": \"BULL\" | \"BEAR\" | \"NEUTRAL\", \"analysis\": \"<your contribution>\"}}\n\
         \n\
         Keep the analysis under 250 words, concrete and specific to the ticker. \
         Do not invent precise figures you are unsure of.",
        role = persona.role,
        focus = persona.focus,
    )
}

/// User message for one invocation.
pub fn build_debate_prompt(ticker: &str) -> String {
    format!(
        "## TICKER\n{ticker}\n\n\
         ## TASK\n\
         Give your contribution to the committee debate on {ticker}. \
         State your stance and the two or three points that matter most."
    )
}
